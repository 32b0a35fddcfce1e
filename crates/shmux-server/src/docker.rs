//! Container runtime interface.
//!
//! The runtime (`docker` by default) is invoked as an external process:
//! a one-shot `ps` for listing, and PTY-attached `exec`/`attach` spawns
//! built in [`crate::session::pty::SpawnProfile`]. No library binding.

use regex::Regex;
use shmux_core::messages::{ContainerInfo, ContainerState};
use shmux_core::{ShmuxError, ShmuxResult};
use tokio::process::Command;
use tracing::warn;

/// The `--format` template handed to `ps`; one tab-separated line per
/// container.
const PS_FORMAT: &str = "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}\t{{.State}}";

/// A compiled entry of `allowed_container_patterns`. Patterns that fail to
/// compile as regex fall back to exact-or-prefix string matching.
#[derive(Debug, Clone)]
pub enum ContainerPattern {
    Regex(Regex),
    Literal(String),
}

impl ContainerPattern {
    pub fn compile(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(re) => Self::Regex(re),
            Err(e) => {
                warn!(pattern, error = %e, "container pattern is not a valid regex, using literal match");
                Self::Literal(pattern.to_string())
            }
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(candidate),
            Self::Literal(lit) => candidate == lit || candidate.starts_with(lit.as_str()),
        }
    }
}

/// Whether `id`/`name` pass the allowlist. An empty allowlist allows any
/// container.
pub fn container_allowed(patterns: &[ContainerPattern], id: &str, name: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|p| p.matches(id) || p.matches(name))
}

/// Run `<runtime> ps` and parse the tab-delimited table, keeping only
/// containers that pass the allowlist.
pub async fn list_containers(
    runtime: &str,
    patterns: &[ContainerPattern],
) -> ShmuxResult<Vec<ContainerInfo>> {
    let output = Command::new(runtime)
        .args(["ps", "--format", PS_FORMAT])
        .output()
        .await
        .map_err(|e| ShmuxError::Other(format!("failed to run {runtime} ps: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ShmuxError::Other(format!(
            "{runtime} ps failed: {}",
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_ps_output(&stdout)
        .into_iter()
        .filter(|c| container_allowed(patterns, &c.id, &c.name))
        .collect())
}

/// Parse `ps --format` output. Malformed lines are skipped.
pub fn parse_ps_output(stdout: &str) -> Vec<ContainerInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?.trim();
            let name = fields.next()?.trim();
            let image = fields.next()?.trim();
            let status = fields.next()?.trim();
            let state = fields.next()?.trim();
            if id.is_empty() {
                return None;
            }
            Some(ContainerInfo {
                id: id.to_string(),
                name: name.to_string(),
                image: image.to_string(),
                status: status.to_string(),
                state: ContainerState::parse(state),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ps_table() {
        let out = "abc123\tweb-1\tnginx:latest\tUp 2 hours\trunning\n\
                   def456\tdb\tpostgres:16\tExited (0) 3 days ago\texited\n";
        let containers = parse_ps_output(out);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].id, "abc123");
        assert_eq!(containers[0].name, "web-1");
        assert_eq!(containers[0].state, ContainerState::Running);
        assert_eq!(containers[1].state, ContainerState::Exited);
    }

    #[test]
    fn unknown_state_maps_to_unknown() {
        let containers = parse_ps_output("x\ty\timg\tstatus\trestarting\n");
        assert_eq!(containers[0].state, ContainerState::Unknown);
    }

    #[test]
    fn skips_malformed_lines() {
        let containers = parse_ps_output("not-tab-separated\nid\tname\timg\tst\trunning\n\n");
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "id");
    }

    #[test]
    fn regex_pattern_matches_id_or_name() {
        let patterns = vec![ContainerPattern::compile("^web-")];
        assert!(container_allowed(&patterns, "abc", "web-1"));
        assert!(container_allowed(&patterns, "web-zzz", "other"));
        assert!(!container_allowed(&patterns, "abc", "db"));
    }

    #[test]
    fn invalid_regex_falls_back_to_prefix() {
        let patterns = vec![ContainerPattern::compile("web-[")];
        match &patterns[0] {
            ContainerPattern::Literal(l) => assert_eq!(l, "web-["),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(container_allowed(&patterns, "web-[1]", "x"));
        assert!(!container_allowed(&patterns, "web-1", "x"));
    }

    #[test]
    fn empty_allowlist_allows_all() {
        assert!(container_allowed(&[], "anything", "at-all"));
    }
}
