//! Fork/exec driver for spawn and application processes.
//!
//! Three launch modes, selected by the parameter map:
//!
//! - **remote** — run the command on another host through the remote
//!   shell (`ssh` or `rsh`): `exec(shpath, shname, host, "cd <cwd> &&
//!   <env> <envs…> <args…>")`.
//! - **local shell** — same command line handed to `sh -c`.
//! - **local direct** — `chdir(cwd)` then `execve(exe, argv, envp)`
//!   with argv and envp materialized from the `ARG*`/`ENV*` map keys.
//!
//! Every exec argument is materialized as a `CString` *before* the
//! fork; the child branch only calls `chdir`/`execv*` and `_exit`.
//! A failed exec is fatal to that child.

use std::ffi::CString;

use nix::unistd::{self, ForkResult, Pid};

use grove_common::{Result, SpawnError, StrMap};

/// Local launch through a shell wrapper (`LOCAL=sh`).
pub const KEY_LOCAL_SHELL: &str = "sh";
/// Local launch by direct exec (`LOCAL=direct`).
pub const KEY_LOCAL_DIRECT: &str = "direct";

/// A fully materialized exec, ready to run in a forked child.
struct ExecPlan {
    /// Path of the file to exec.
    exe: CString,
    /// argv, including argv[0].
    argv: Vec<CString>,
    /// Replacement environment; `None` inherits the parent's.
    envp: Option<Vec<CString>>,
    /// Working directory to enter before the exec.
    chdir: Option<CString>,
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| SpawnError::launch(format!("`{s}` contains a NUL byte")))
}

/// Join the values `PREFIX0..PREFIX{COUNT-1}` with single spaces.
fn join_indexed(map: &StrMap, count_key: &str, prefix: &str) -> Result<String> {
    let count: usize = map.require_int(count_key)?;
    let mut parts = Vec::with_capacity(count);
    for i in 0..count {
        let key = format!("{prefix}{i}");
        parts.push(map.require(&key)?);
    }
    Ok(parts.join(" "))
}

/// Materialize `PREFIX0..PREFIX{COUNT-1}` as a CString vector.
fn indexed_cstrings(map: &StrMap, count_key: &str, prefix: &str) -> Result<Vec<CString>> {
    let count: usize = map.require_int(count_key)?;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let key = format!("{prefix}{i}");
        out.push(cstring(map.require(&key)?)?);
    }
    Ok(out)
}

/// Look up the resolved path of a tool recorded in the parameter map.
fn tool_path<'a>(params: &'a StrMap, tool: &str) -> Result<&'a str> {
    params
        .get(tool)
        .ok_or_else(|| SpawnError::launch(format!("path to `{tool}` command not set")))
}

/// The remote-shell name from the `SH` key, validated.
fn remote_shell(params: &StrMap) -> Result<&str> {
    let shname = params
        .get("SH")
        .ok_or_else(|| SpawnError::launch("remote shell not set in SH key"))?;
    if shname != "ssh" && shname != "rsh" {
        return Err(SpawnError::launch(format!(
            "unknown remote shell `{shname}`"
        )));
    }
    Ok(shname)
}

/// `cd <cwd> && <env> <envs…> <args…>` — the command line both shell
/// modes hand to their shell.
fn shell_command(params: &StrMap, cwd: &str, args: &StrMap, envs: &StrMap) -> Result<String> {
    let envpath = tool_path(params, "env")?;
    let envstr = join_indexed(envs, "ENVS", "ENV")?;
    let argstr = join_indexed(args, "ARGS", "ARG")?;
    Ok(format!("cd {cwd} && {envpath} {envstr} {argstr}"))
}

fn plan_remote(
    host: &str,
    params: &StrMap,
    cwd: &str,
    args: &StrMap,
    envs: &StrMap,
) -> Result<ExecPlan> {
    let shname = remote_shell(params)?;
    let shpath = tool_path(params, shname)?;
    let command = shell_command(params, cwd, args, envs)?;
    Ok(ExecPlan {
        exe: cstring(shpath)?,
        argv: vec![cstring(shname)?, cstring(host)?, cstring(&command)?],
        envp: None,
        chdir: None,
    })
}

fn plan_shell(params: &StrMap, cwd: &str, args: &StrMap, envs: &StrMap) -> Result<ExecPlan> {
    let shpath = tool_path(params, "sh")?;
    let command = shell_command(params, cwd, args, envs)?;
    Ok(ExecPlan {
        exe: cstring(shpath)?,
        argv: vec![cstring("sh")?, cstring("-c")?, cstring(&command)?],
        envp: None,
        chdir: None,
    })
}

fn plan_direct(cwd: &str, exe: &str, args: &StrMap, envs: &StrMap) -> Result<ExecPlan> {
    Ok(ExecPlan {
        exe: cstring(exe)?,
        argv: indexed_cstrings(args, "ARGS", "ARG")?,
        envp: Some(indexed_cstrings(envs, "ENVS", "ENV")?),
        chdir: Some(cstring(cwd)?),
    })
}

/// Fork and run the plan in the child. The parent returns the child's
/// pid immediately; the child never returns (`_exit(127)` if the exec
/// fails).
fn fork_exec(plan: ExecPlan) -> Result<Pid> {
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => {
            if let Some(dir) = plan.chdir.as_deref() {
                if unistd::chdir(dir).is_err() {
                    unsafe { nix::libc::_exit(126) };
                }
            }
            let _ = match plan.envp.as_deref() {
                Some(envp) => unistd::execve(&plan.exe, &plan.argv, envp),
                None => unistd::execv(&plan.exe, &plan.argv),
            };
            // Only reached when the exec failed.
            unsafe { nix::libc::_exit(127) }
        }
        Err(e) => Err(SpawnError::launch(format!("fork failed: {e}"))),
    }
}

/// Fork a process that runs `exe` with the given argument and
/// environment maps. `host = Some(..)` launches through the remote
/// shell; `host = None` uses the mode in the `LOCAL` key.
pub fn fork_proc(
    host: Option<&str>,
    params: &StrMap,
    cwd: &str,
    exe: &str,
    args: &StrMap,
    envs: &StrMap,
) -> Result<Pid> {
    let plan = match host {
        Some(host) => plan_remote(host, params, cwd, args, envs)?,
        None => {
            let local = params
                .get("LOCAL")
                .ok_or_else(|| SpawnError::launch("local launch mode not set in LOCAL key"))?;
            match local {
                KEY_LOCAL_SHELL => plan_shell(params, cwd, args, envs)?,
                KEY_LOCAL_DIRECT => plan_direct(cwd, exe, args, envs)?,
                other => {
                    return Err(SpawnError::launch(format!(
                        "unknown LOCAL key value `{other}`"
                    )))
                }
            }
        }
    };
    let pid = fork_exec(plan)?;
    tracing::debug!(pid = pid.as_raw(), exe, host, "forked");
    Ok(pid)
}

/// Fork a remote copy (`scp`/`rcp`, matching the remote shell) of
/// `exepath` to the same path on `host`. The caller waits on the
/// returned pid to know the copy finished.
pub fn copy_exe(params: &StrMap, host: &str, exepath: &str) -> Result<Pid> {
    let copier = match remote_shell(params)? {
        "rsh" => "rcp",
        _ => "scp",
    };
    let copier_path = tool_path(params, copier)?;
    let dst = format!("{host}:{exepath}");
    let plan = ExecPlan {
        exe: cstring(copier_path)?,
        argv: vec![cstring(copier_path)?, cstring(exepath)?, cstring(&dst)?],
        envp: None,
        chdir: None,
    };
    fork_exec(plan)
}

/// Copy a binary to `/tmp/<basename>` on the local filesystem and
/// return the staged path.
pub fn copy_to_tmp(src: &str) -> Result<std::path::PathBuf> {
    let dst = crate::tree::tmp_path_for(src)?;
    std::fs::copy(src, &dst)
        .map_err(|e| SpawnError::io(format!("copy `{src}` to `{}` failed: {e}", dst.display())))?;
    let staged = std::fs::File::open(&dst)
        .map_err(|e| SpawnError::io(format!("open `{}` failed: {e}", dst.display())))?;
    staged
        .sync_all()
        .map_err(|e| SpawnError::io(format!("fsync `{}` failed: {e}", dst.display())))?;
    crate::tree::set_executable(&dst)?;
    Ok(dst)
}

/// Resolve a command to an absolute path: realpath when it already
/// names a file, then a `$PATH` search. Returns `None` when nothing
/// matches.
pub fn path_search(command: &str) -> Option<String> {
    if let Ok(real) = std::fs::canonicalize(command) {
        return Some(real.to_string_lossy().into_owned());
    }
    if command.starts_with('/') {
        return Some(command.to_string());
    }
    let found = which::which(command).ok()?;
    let resolved = std::fs::canonicalize(&found).unwrap_or(found);
    Some(resolved.to_string_lossy().into_owned())
}

/// Record a tool's resolved path in the map under its own name, falling
/// back to the bare name when the search fails.
pub fn find_command(map: &mut StrMap, command: &str) {
    match path_search(command) {
        Some(path) => map.set(command, path),
        None => map.set(command, command),
    }
}
