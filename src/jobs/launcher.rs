//! Process launcher: turns a job intent into an argv and spawns it.
//!
//! Argument building is pure. Anything that needs the filesystem (tool
//! configuration detection, image attachments) is resolved beforehand and
//! handed in through [`ArgContext`].

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use uuid::Uuid;

use super::models::{ImageAttachment, JobIntent, PermissionMode, ToolOptions};
use crate::errors::LaunchError;

/// Tools granted under plan mode when the caller supplies no allow-list.
pub const PLAN_MODE_TOOLS: &[&str] = &["Read", "Task", "exit_plan_mode", "TodoRead", "TodoWrite"];

/// Inputs to argument building that come from configuration or from the
/// environment rather than from the request.
#[derive(Debug, Clone, Default)]
pub struct ArgContext {
    /// Tool executable, e.g. `claude`.
    pub tool_command: String,
    /// Model used for new turns that don't name one.
    pub default_model: String,
    /// Set when the tool's configuration file advertises MCP servers.
    pub mcp_config: Option<PathBuf>,
    /// Image attachments already written to disk.
    pub image_paths: Vec<PathBuf>,
}

/// Split a shell command on whitespace. There is no quoting support:
/// `echo "a b"` yields `["echo", "\"a", "b\""]`.
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

/// Build the full argv (program first) for a job intent.
pub fn build_argv(intent: &JobIntent, ctx: &ArgContext) -> Vec<String> {
    match intent {
        JobIntent::Command { command } => split_command(command),
        JobIntent::Tool { input, options } => {
            let mut argv = vec![ctx.tool_command.clone()];
            argv.extend(build_tool_args(input, options, ctx));
            argv
        }
    }
}

/// Arguments for a coding-tool turn, excluding the program name.
pub fn build_tool_args(input: &str, options: &ToolOptions, ctx: &ArgContext) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    let resume_id = options
        .tool_session_id
        .as_deref()
        .filter(|id| options.resume && !id.is_empty());
    if let Some(id) = resume_id {
        args.extend(["--resume".to_string(), id.to_string()]);
    }

    args.extend(
        ["--output-format", "stream-json", "--verbose"]
            .iter()
            .map(|s| s.to_string()),
    );

    if let Some(path) = &ctx.mcp_config {
        args.push("--mcp-config".to_string());
        args.push(path.display().to_string());
    }

    if resume_id.is_none() {
        let model = options
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&ctx.default_model);
        args.extend(["--model".to_string(), model.to_string()]);
    }

    let plan = options.permission_mode == PermissionMode::Plan;
    if options.permission_mode != PermissionMode::Default {
        args.extend([
            "--permission-mode".to_string(),
            options.permission_mode.as_str().to_string(),
        ]);
    }

    if options.skip_permissions && !plan {
        args.push("--dangerously-skip-permissions".to_string());
    } else {
        for tool in &options.allowed_tools {
            args.extend(["--allowedTools".to_string(), tool.clone()]);
        }
        for tool in &options.disallowed_tools {
            args.extend(["--disallowedTools".to_string(), tool.clone()]);
        }
        if plan && options.allowed_tools.is_empty() {
            for tool in PLAN_MODE_TOOLS {
                args.extend(["--allowedTools".to_string(), tool.to_string()]);
            }
        }
    }

    if !input.is_empty() {
        let mut payload = input.to_string();
        if !ctx.image_paths.is_empty() {
            let paths = ctx
                .image_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            payload.push_str("\n\nAttached images: ");
            payload.push_str(&paths);
        }
        args.extend(["--print".to_string(), "--".to_string(), payload]);
    }

    args
}

/// Returns `config_file` when it advertises MCP servers, either at the top
/// level or under any per-project entry. Missing or unreadable files count
/// as "no integrations".
pub fn detect_mcp_config(config_file: &Path) -> Option<PathBuf> {
    let contents = std::fs::read_to_string(config_file).ok()?;
    let config: serde_json::Value = serde_json::from_str(&contents).ok()?;

    let non_empty = |v: Option<&serde_json::Value>| {
        v.and_then(|s| s.as_object()).is_some_and(|m| !m.is_empty())
    };

    if non_empty(config.get("mcpServers")) {
        return Some(config_file.to_path_buf());
    }
    for key in ["projects", "claudeProjects"] {
        if let Some(projects) = config.get(key).and_then(|p| p.as_object())
            && projects.values().any(|p| non_empty(p.get("mcpServers")))
        {
            return Some(config_file.to_path_buf());
        }
    }
    None
}

/// Decode image attachments into `dir`, returning the written paths in
/// order.
pub async fn write_attachments(
    dir: &Path,
    images: &[ImageAttachment],
) -> std::io::Result<Vec<PathBuf>> {
    if images.is_empty() {
        return Ok(Vec::new());
    }
    tokio::fs::create_dir_all(dir).await?;
    let mut paths = Vec::with_capacity(images.len());
    for (i, image) in images.iter().enumerate() {
        let bytes = image
            .decode()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let ext = image.extension().unwrap_or("bin");
        let path = dir.join(format!("image-{}.{}", i + 1, ext));
        tokio::fs::write(&path, bytes).await?;
        paths.push(path);
    }
    Ok(paths)
}

// ── Spawning ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Environment variables that let the child discover who it runs for.
pub fn job_env(owner_id: Uuid, scope_id: Uuid, working_dir: &Path) -> Vec<(String, String)> {
    vec![
        ("USER_ID".to_string(), owner_id.to_string()),
        ("PROJECT_ID".to_string(), scope_id.to_string()),
        ("WORKING_DIR".to_string(), working_dir.display().to_string()),
    ]
}

/// A spawned child with its output pipes detached. The caller owns `child`
/// for `wait()` and `kill()`. On unix the child leads its own process
/// group, whose id is `pid`.
pub struct ProcessHandle {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub pid: u32,
}

pub fn launch(spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
    let (program, args) = spec.argv.split_first().ok_or_else(|| LaunchError::Spawn {
        program: String::new(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&spec.cwd)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        // Nested tool sessions refuse to start when this is inherited.
        .env_remove("CLAUDECODE")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own group, so a kill reaches everything the job forked.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id().unwrap_or_default();
    let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;

    tracing::debug!(pid, program = %program, cwd = %spec.cwd.display(), "spawned process");
    Ok(ProcessHandle {
        child,
        stdout,
        stderr,
        pid,
    })
}
