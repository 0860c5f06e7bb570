//! Validated child-process script runner backing `MODULE_SCRIPT`.
//!
//! A script name must end in `.sh` and otherwise contain only lowercase
//! letters, digits, `-`, and `_`. The script is looked up under the
//! configured scripts folder, must be executable, and is run to completion;
//! the first line of its stdout (if any) is returned for publication.

use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// The script ran and printed a first line of output.
    Output(String),
    /// The script ran but produced no output.
    NoOutput,
    /// The name failed validation, or the script does not exist / is not
    /// executable.
    Invalid,
    /// The script ran but exited non-zero, or could not be spawned.
    Failed,
}

fn is_valid_script_name(name: &str) -> bool {
    match name.strip_suffix(".sh") {
        Some(stem) => !stem.is_empty()
            && stem
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_'),
        None => false,
    }
}

pub async fn run_script(scripts_folder: &Path, name: &str) -> ScriptOutcome {
    if !is_valid_script_name(name) {
        tracing::debug!(name, "invalid script name");
        return ScriptOutcome::Invalid;
    }

    let path = scripts_folder.join(name);
    let executable = tokio::fs::metadata(&path)
        .await
        .map(|metadata| is_executable(&metadata))
        .unwrap_or(false);
    if !executable {
        tracing::debug!(path = %path.display(), "cannot execute script");
        return ScriptOutcome::Invalid;
    }

    let output = match tokio::process::Command::new(&path).output().await {
        Ok(output) => output,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to run script");
            return ScriptOutcome::Failed;
        }
    };
    if !output.status.success() {
        return ScriptOutcome::Failed;
    }

    match String::from_utf8_lossy(&output.stdout).lines().next() {
        Some(line) if !line.is_empty() => ScriptOutcome::Output(line.to_string()),
        _ => ScriptOutcome::NoOutput,
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}
