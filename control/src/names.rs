//! Deterministic naming for every host-cluster object the engine creates.
//!
//! Re-running a task must converge instead of duplicating external
//! resources, so every mutating gateway call is keyed by a name derived
//! purely from stored identifiers.

use uuid::Uuid;

/// DNS label length limit.
const MAX_LABEL: usize = 63;

/// First 8 hex chars of the UUID, stable across processes.
pub fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// vCluster instance name for a workspace. Assigned during CREATE and
/// never changed afterwards.
pub fn instance_name(workspace_id: Uuid) -> String {
    format!("vc-{}", short_id(workspace_id))
}

/// Host namespace holding the vCluster control plane objects.
pub fn workspace_namespace(workspace_id: Uuid) -> String {
    format!("ws-{}", short_id(workspace_id))
}

/// Kubernetes namespace for a project: workspace prefix plus the
/// sanitized project name, truncated to a legal DNS label.
pub fn project_namespace(workspace_id: Uuid, project_name: &str) -> String {
    let prefix = workspace_namespace(workspace_id);
    let sanitized = sanitize_dns1123(project_name);
    truncate_label(&format!("{prefix}-{sanitized}"))
}

pub fn deployment_name(application_id: Uuid, app_name: &str) -> String {
    truncate_label(&format!(
        "app-{}-{}",
        short_id(application_id),
        sanitize_dns1123(app_name)
    ))
}

/// One-shot Job name for a cron execution.
pub fn execution_job_name(execution_id: Uuid) -> String {
    format!("cronexec-{}", short_id(execution_id))
}

/// Build Job name for a function version.
pub fn function_build_name(version_id: Uuid) -> String {
    format!("fnbuild-{}", short_id(version_id))
}

/// Secret name for a stored credential.
pub fn credential_secret_name(workspace_id: Uuid, credential_name: &str) -> String {
    truncate_label(&format!(
        "cred-{}-{}",
        short_id(workspace_id),
        sanitize_dns1123(credential_name)
    ))
}

/// Backup snapshot name for a workspace backup attempt. Keyed by task id
/// so a retried attempt converges on the same snapshot.
pub fn backup_name(workspace_id: Uuid, task_id: Uuid) -> String {
    format!("bak-{}-{}", short_id(workspace_id), short_id(task_id))
}

/// Lowercase, replace every non-alphanumeric run with a single '-',
/// strip leading/trailing '-'. Result is a valid DNS-1123 label body
/// (possibly empty for degenerate input).
pub fn sanitize_dns1123(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true; // swallow leading separators
    for c in s.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

fn truncate_label(s: &str) -> String {
    if s.len() <= MAX_LABEL {
        return s.trim_end_matches('-').to_string();
    }
    s[..MAX_LABEL].trim_end_matches('-').to_string()
}

/// Content hash stamped on host objects so drift is detectable.
pub fn spec_hash<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    let result = hasher.finalize();
    hex::encode(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_and_lowercases() {
        assert_eq!(sanitize_dns1123("My Cool__Project!"), "my-cool-project");
        assert_eq!(sanitize_dns1123("--weird--"), "weird");
        assert_eq!(sanitize_dns1123("már-ké"), "m-r-k");
        assert_eq!(sanitize_dns1123(""), "");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in ["My Cool Project", "a--b", "UPPER", "x1-y2"] {
            let once = sanitize_dns1123(input);
            assert_eq!(sanitize_dns1123(&once), once);
        }
    }

    #[test]
    fn names_are_deterministic_and_distinct() {
        let ws = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert_eq!(instance_name(ws), instance_name(ws));
        assert_ne!(instance_name(ws), instance_name(other));
        let task = Uuid::new_v4();
        assert_eq!(backup_name(ws, task), backup_name(ws, task));
        assert_ne!(backup_name(ws, task), backup_name(ws, Uuid::new_v4()));
    }

    #[test]
    fn namespace_fits_dns_label() {
        let ws = Uuid::new_v4();
        let ns = project_namespace(ws, &"very-long-project-name".repeat(8));
        assert!(ns.len() <= 63);
        assert!(!ns.ends_with('-'));
        assert!(ns.starts_with("ws-"));
    }
}
