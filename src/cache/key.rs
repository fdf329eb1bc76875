//! Cache key grammar shared by the read and refresh paths.
//!
//! Keys render as `Method:arg1:arg2`. Building and parsing both live here so
//! the argument shapes, and the list limits in particular, cannot drift
//! between the side that reads an entry and the side that writes it.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Branch list size used by composite reads and by the refresher.
pub const BRANCH_LIST_LIMIT: u32 = 50;

/// Pipeline list size used by aggregated reads and by the refresher.
pub const PIPELINE_LIST_LIMIT: u32 = 20;

/// Branch tried when the project's default branch has no pipeline.
pub const FALLBACK_BRANCH: &str = "master";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
  Projects,
  ProjectCount,
  LatestPipeline { project_id: String, branch: String },
  Pipelines { project_id: String, limit: u32 },
  Branches { project_id: String, limit: u32 },
  Branch { project_id: String, name: String },
  MergeRequests { project_id: String },
  Issues { project_id: String },
  CurrentUser,
}

impl CacheKey {
  /// Branch list at the shared limit.
  pub fn branches(project_id: &str) -> Self {
    Self::Branches {
      project_id: project_id.to_string(),
      limit: BRANCH_LIST_LIMIT,
    }
  }

  /// Pipeline list at the shared limit.
  pub fn pipelines(project_id: &str) -> Self {
    Self::Pipelines {
      project_id: project_id.to_string(),
      limit: PIPELINE_LIST_LIMIT,
    }
  }

  pub fn latest_pipeline(project_id: &str, branch: &str) -> Self {
    Self::LatestPipeline {
      project_id: project_id.to_string(),
      branch: branch.to_string(),
    }
  }

  pub fn branch(project_id: &str, name: &str) -> Self {
    Self::Branch {
      project_id: project_id.to_string(),
      name: name.to_string(),
    }
  }

  pub fn merge_requests(project_id: &str) -> Self {
    Self::MergeRequests {
      project_id: project_id.to_string(),
    }
  }

  pub fn issues(project_id: &str) -> Self {
    Self::Issues {
      project_id: project_id.to_string(),
    }
  }

  pub fn method(&self) -> &'static str {
    match self {
      Self::Projects => "GetProjects",
      Self::ProjectCount => "GetProjectCount",
      Self::LatestPipeline { .. } => "GetLatestPipeline",
      Self::Pipelines { .. } => "GetPipelines",
      Self::Branches { .. } => "GetBranches",
      Self::Branch { .. } => "GetBranch",
      Self::MergeRequests { .. } => "GetMergeRequests",
      Self::Issues { .. } => "GetIssues",
      Self::CurrentUser => "GetCurrentUser",
    }
  }

  /// The project an entry belongs to, if it is project-scoped.
  pub fn project_id(&self) -> Option<&str> {
    match self {
      Self::Projects | Self::ProjectCount | Self::CurrentUser => None,
      Self::LatestPipeline { project_id, .. }
      | Self::Pipelines { project_id, .. }
      | Self::Branches { project_id, .. }
      | Self::Branch { project_id, .. }
      | Self::MergeRequests { project_id }
      | Self::Issues { project_id } => Some(project_id),
    }
  }

  /// Human-readable form for log lines.
  pub fn description(&self) -> String {
    match self {
      Self::Projects => "project list".to_string(),
      Self::ProjectCount => "project count".to_string(),
      Self::LatestPipeline { project_id, branch } => {
        format!("latest pipeline of {} on {}", project_id, branch)
      }
      Self::Pipelines { project_id, limit } => {
        format!("last {} pipelines of {}", limit, project_id)
      }
      Self::Branches { project_id, limit } => format!("{} branches of {}", limit, project_id),
      Self::Branch { project_id, name } => format!("branch {} of {}", name, project_id),
      Self::MergeRequests { project_id } => format!("merge requests of {}", project_id),
      Self::Issues { project_id } => format!("issues of {}", project_id),
      Self::CurrentUser => "current user".to_string(),
    }
  }
}

/// Exact keys and key prefixes covering everything cached for one project.
pub(crate) fn project_scopes(project_id: &str) -> (Vec<String>, Vec<String>) {
  let exact = vec![
    CacheKey::merge_requests(project_id).to_string(),
    CacheKey::issues(project_id).to_string(),
  ];
  let prefixes = ["GetLatestPipeline", "GetPipelines", "GetBranches", "GetBranch"]
    .iter()
    .map(|method| format!("{}:{}:", method, project_id))
    .collect();
  (exact, prefixes)
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let method = self.method();
    match self {
      Self::Projects | Self::ProjectCount | Self::CurrentUser => f.write_str(method),
      Self::LatestPipeline { project_id, branch } => {
        write!(f, "{}:{}:{}", method, project_id, branch)
      }
      Self::Pipelines { project_id, limit } | Self::Branches { project_id, limit } => {
        write!(f, "{}:{}:{}", method, project_id, limit)
      }
      Self::Branch { project_id, name } => write!(f, "{}:{}:{}", method, project_id, name),
      Self::MergeRequests { project_id } | Self::Issues { project_id } => {
        write!(f, "{}:{}", method, project_id)
      }
    }
  }
}

impl FromStr for CacheKey {
  type Err = Error;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    let (method, rest) = match raw.split_once(':') {
      Some((method, rest)) => (method, Some(rest)),
      None => (raw, None),
    };

    let arity = match method {
      "GetProjects" | "GetProjectCount" | "GetCurrentUser" => 0,
      "GetMergeRequests" | "GetIssues" => 1,
      "GetLatestPipeline" | "GetPipelines" | "GetBranches" | "GetBranch" => 2,
      _ => return Err(Error::key_format(raw, format!("unknown method {:?}", method))),
    };

    let args: Vec<&str> = match (arity, rest) {
      (0, None) => Vec::new(),
      (0, Some(_)) => return Err(Error::key_format(raw, format!("{} takes no arguments", method))),
      (_, None) => {
        return Err(Error::key_format(
          raw,
          format!("{} takes {} arguments, got 0", method, arity),
        ))
      }
      (1, Some(rest)) => vec![rest],
      // The final argument keeps any remaining ':' so branch names survive.
      (_, Some(rest)) => match rest.split_once(':') {
        Some((first, second)) => vec![first, second],
        None => {
          return Err(Error::key_format(
            raw,
            format!("{} takes {} arguments, got 1", method, arity),
          ))
        }
      },
    };

    if arity == 1 && args[0].contains(':') {
      return Err(Error::key_format(
        raw,
        format!("{} takes 1 argument, got more", method),
      ));
    }
    if let Some(position) = args.iter().position(|arg| arg.is_empty()) {
      return Err(Error::key_format(
        raw,
        format!("argument {} is empty", position + 1),
      ));
    }

    let parse_limit = |value: &str| -> Result<u32, Error> {
      match value.parse::<u32>() {
        Ok(limit) if limit > 0 => Ok(limit),
        _ => Err(Error::key_format(
          raw,
          format!("limit {:?} is not a positive integer", value),
        )),
      }
    };

    let key = match method {
      "GetProjects" => Self::Projects,
      "GetProjectCount" => Self::ProjectCount,
      "GetCurrentUser" => Self::CurrentUser,
      "GetMergeRequests" => Self::merge_requests(args[0]),
      "GetIssues" => Self::issues(args[0]),
      "GetLatestPipeline" => Self::latest_pipeline(args[0], args[1]),
      "GetBranch" => Self::branch(args[0], args[1]),
      "GetPipelines" => Self::Pipelines {
        project_id: args[0].to_string(),
        limit: parse_limit(args[1])?,
      },
      "GetBranches" => Self::Branches {
        project_id: args[0].to_string(),
        limit: parse_limit(args[1])?,
      },
      _ => unreachable!("method validated above"),
    };
    Ok(key)
  }
}
