//! Helper daemons started alongside the agent: a session `dbus-daemon`
//! and an `ssh-agent`, each announcing its socket address on the first
//! line of stdout.

use std::process::Stdio;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

/// A running helper; dropped handles leave the process running, so the
/// agent keeps these and signals them on shutdown.
pub struct Helper {
    child: tokio::process::Child,
}

impl Helper {
    pub fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
}

impl std::fmt::Debug for Helper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Helper({:?})", self.child.id())
    }
}

/// Start `argv` unless `env_var` is already set, scrape the socket
/// address from its first output line with `pattern`, and export it.
async fn start_helper(argv: &[&str], pattern: &str, env_var: &str) -> Option<Helper> {
    match std::env::var(env_var) {
        Ok(value) if !value.is_empty() => return None,
        _ => {}
    }

    let mut command = tokio::process::Command::new(argv[0]);
    command
        .args(&argv[1..])
        .stdout(Stdio::piped())
        // The daemons produce useless messages on stderr mixed in.
        .stderr(Stdio::null())
        .env_remove("G_DEBUG");

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            debug!("couldn't start {}: {}", argv[0], err);
            return None;
        }
    };

    let stdout = child.stdout.take().expect("stdout was piped");
    let mut lines = BufReader::new(stdout).lines();
    let first_line = match lines.next_line().await {
        Ok(Some(line)) => line,
        Ok(None) | Err(_) => {
            warn!("couldn't read address from {}", argv[0]);
            let _ = child.start_kill();
            return None;
        }
    };

    let regex = Regex::new(pattern).expect("helper pattern compiles");
    let address = match regex.captures(&first_line).and_then(|c| c.get(1)) {
        Some(address) => address.as_str().to_string(),
        None => {
            warn!(
                "output from {} didn't match expected pattern {}",
                argv[0], pattern
            );
            let _ = child.start_kill();
            return None;
        }
    };

    debug!("launched {}: {:?}", argv[0], child.id());
    std::env::set_var(env_var, address);

    Some(Helper { child })
}

pub async fn start_dbus_daemon() -> Option<Helper> {
    start_helper(
        &["dbus-daemon", "--print-address", "--session"],
        "^(.*)$",
        "DBUS_SESSION_BUS_ADDRESS",
    )
    .await
}

pub async fn start_ssh_agent() -> Option<Helper> {
    start_helper(
        &["ssh-agent", "-s", "-D"],
        "SSH_AUTH_SOCK=([^;]*);",
        "SSH_AUTH_SOCK",
    )
    .await
}
