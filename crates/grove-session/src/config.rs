//! Environment configuration for the root spawn process.
//!
//! The root turns its `SPAWN_*` environment and the host list from the
//! command line into the parameter map every other node receives from
//! its parent. Validation is strict: an unrecognized or malformed value
//! is a fatal `ConfigError` raised before any child process is forked.
//!
//! Non-root processes read none of these except `SPAWN_PARENT` and
//! `SPAWN_ID`, which the parent sets on exec.

use grove_common::{Result, SpawnError, StrMap};
use grove_net::Transport;

use crate::launch::{self, KEY_LOCAL_DIRECT, KEY_LOCAL_SHELL};

/// Parent endpoint address; presence selects non-root mode.
pub const ENV_PARENT: &str = "SPAWN_PARENT";
/// This spawn's rank, set by the parent on exec.
pub const ENV_ID: &str = "SPAWN_ID";

/// MPIR debug target: the spawn tree itself.
pub const KEY_MPIR_SPAWN: &str = "spawn";
/// MPIR debug target: the application processes.
pub const KEY_MPIR_APP: &str = "app";

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Validate a value against a closed set of choices.
fn parse_choice(name: &str, value: Option<&str>, allowed: &[&str], default: &str) -> Result<String> {
    match value {
        None => Ok(default.to_string()),
        Some(v) if allowed.contains(&v) => Ok(v.to_string()),
        Some(v) => Err(SpawnError::config(format!(
            "{name} must be one of {allowed:?}, got `{v}`"
        ))),
    }
}

/// Validate a 0/1 flag.
fn parse_flag(name: &str, value: Option<&str>) -> Result<bool> {
    match value {
        None | Some("0") => Ok(false),
        Some("1") => Ok(true),
        Some(v) => Err(SpawnError::config(format!(
            "{name} must be 0 or 1, got `{v}`"
        ))),
    }
}

/// Validate an integer with a lower bound.
fn parse_int_min(name: &str, value: Option<&str>, min: usize, default: usize) -> Result<usize> {
    let v = match value {
        None => return Ok(default),
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| SpawnError::config(format!("{name} must be an integer, got `{v}`")))?,
    };
    if v < min {
        return Err(SpawnError::config(format!(
            "{name} must be at least {min}, got {v}"
        )));
    }
    Ok(v)
}

/// Transport kind for the main endpoint, selected by `SPAWN_NET`.
fn parse_net(value: Option<&str>) -> Result<Transport> {
    match value {
        None | Some("tcp") => Ok(Transport::Tcp),
        Some("ibud") => Err(SpawnError::config(
            "SPAWN_NET=ibud names a transport driver this build does not carry",
        )),
        Some(v) => Err(SpawnError::config(format!(
            "SPAWN_NET must be \"tcp\" or \"ibud\", got `{v}`"
        ))),
    }
}

/// Transport kind for the main endpoint (root only).
pub fn net_kind() -> Result<Transport> {
    parse_net(env("SPAWN_NET").as_deref())
}

/// MPIR attach target from `SPAWN_DBG`, defaulting to the spawn tree.
pub fn debug_target() -> Result<String> {
    parse_choice(
        "SPAWN_DBG",
        env("SPAWN_DBG").as_deref(),
        &[KEY_MPIR_SPAWN, KEY_MPIR_APP],
        KEY_MPIR_SPAWN,
    )
}

/// Build the root's parameter map from the environment and host list.
///
/// `own_host` becomes host 0, so the job size is `hosts.len() + 1`.
/// When `debugged` is set the map carries the MPIR target for the whole
/// tree.
pub fn root_params(
    own_host: &str,
    hosts: &[String],
    argv0: &str,
    debugged: bool,
) -> Result<StrMap> {
    let mut params = StrMap::new();

    if debugged {
        params.set("MPIR", debug_target()?);
    }

    let copy = parse_flag("SPAWN_COPY", env("SPAWN_COPY").as_deref())?;
    params.set("COPY", if copy { "1" } else { "0" });

    let spawn_path = launch::path_search(argv0).ok_or_else(|| {
        SpawnError::config(format!("launcher executable `{argv0}` not found"))
    })?;
    if copy {
        let staged = launch::copy_to_tmp(&spawn_path)?;
        params.set("EXE", staged.to_string_lossy());
    } else {
        params.set("EXE", spawn_path);
    }

    let ranks = hosts.len() + 1;
    params.set("N", ranks.to_string());
    params.set("0", own_host);
    for (i, host) in hosts.iter().enumerate() {
        params.set((i + 1).to_string(), host.as_str());
    }

    let degree = parse_int_min("SPAWN_DEGREE", env("SPAWN_DEGREE").as_deref(), 2, 2)?;
    params.set("DEG", degree.to_string());

    let sh = parse_choice("SPAWN_SH", env("SPAWN_SH").as_deref(), &["ssh", "rsh"], "rsh")?;
    params.set("SH", sh);

    let local = parse_choice(
        "SPAWN_LOCAL",
        env("SPAWN_LOCAL").as_deref(),
        &[KEY_LOCAL_SHELL, KEY_LOCAL_DIRECT],
        KEY_LOCAL_DIRECT,
    )?;
    params.set("LOCAL", local);

    // Resolve the tools every node will exec, once, at the root.
    for tool in ["ssh", "scp", "rsh", "rcp", "sh", "env"] {
        launch::find_command(&mut params, tool);
    }

    Ok(params)
}

/// Build the application parameter map from the environment (root only).
pub fn app_params() -> Result<StrMap> {
    let mut app = StrMap::new();
    app.set("NAME", "GROUP_0");

    let exe = env("SPAWN_EXE").unwrap_or_else(|| "/bin/hostname".to_string());
    let exe_path = launch::path_search(&exe)
        .ok_or_else(|| SpawnError::config(format!("application executable `{exe}` not found")))?;
    app.set("EXE", exe_path);

    let cwd = std::env::current_dir()
        .map_err(|e| SpawnError::io(format!("getcwd failed: {e}")))?;
    app.set("CWD", cwd.to_string_lossy());

    let ppn = parse_int_min("SPAWN_PPN", env("SPAWN_PPN").as_deref(), 1, 1)?;
    app.set("PPN", ppn.to_string());

    for (key, var) in [
        ("PMI", "SPAWN_PMI"),
        ("RING", "SPAWN_RING"),
        ("FIFO", "SPAWN_FIFO"),
        ("BIN_BCAST", "SPAWN_BCAST_BIN"),
    ] {
        let on = parse_flag(var, env(var).as_deref())?;
        app.set(key, if on { "1" } else { "0" });
    }

    // One job id for the whole session; PMI clients echo it back.
    app.set("JOBID", std::process::id().to_string());

    Ok(app)
}
