//! The Cockpit agent, run automatically inside a Cockpit session with
//! the credentials of the logged-in user. It speaks the framed
//! protocol on stdio.

use std::io::IsTerminal;
use std::io::Write;
use std::rc::Rc;

use tracing::warn;

use cockpit_bridge::channel::{Context, Pool};
use cockpit_bridge::packages::{self, Packages};
use cockpit_bridge::protocol::Init;
use cockpit_bridge::router::{fdpass, Router};
use cockpit_bridge::transport::{Framing, Transport};
use cockpit_bridge::{helper, os_release};

const USAGE: &str = "\
Usage:
  cockpit-bridge [OPTION...]

  --interact=boundary    Interact with the raw protocol
  --privileged           Privileged copy of the bridge
  --packages             Show Cockpit package information
  --rules                Show Cockpit bridge rules
  --version              Show Cockpit version information

cockpit-bridge is run automatically inside of a Cockpit session. When
run from the command line one of the options above must be specified.
";

#[derive(Default)]
struct Options {
    interact: Option<String>,
    privileged: bool,
    packages: bool,
    rules: bool,
    version: bool,
}

fn parse_args() -> Result<Options, String> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--privileged" => options.privileged = true,
            "--packages" => options.packages = true,
            "--rules" => options.rules = true,
            "--version" => options.version = true,
            "--interact" => {
                options.interact =
                    Some(args.next().ok_or("option --interact requires a boundary")?);
            }
            "--help" | "-h" => {
                print!("{}", USAGE);
                std::process::exit(0);
            }
            other => {
                if let Some(boundary) = other.strip_prefix("--interact=") {
                    options.interact = Some(boundary.to_string());
                } else {
                    return Err(format!("unknown option: {}", other));
                }
            }
        }
    }

    Ok(options)
}

/// The privileged copy receives its stderr over the socketpair that is
/// its stdin, before anything else happens.
fn receive_stderr() {
    let message = "\n{\"command\": \"send-stderr\"}";
    print!("{}\n{}", message.len(), message);
    let _ = std::io::stdout().flush();

    match fdpass::receive_fd(libc::STDIN_FILENO) {
        // EOF: just silently exit.
        Ok(None) => std::process::exit(0),
        Ok(Some(fd)) => unsafe {
            let moved = libc::dup2(fd, libc::STDERR_FILENO);
            assert_eq!(moved, libc::STDERR_FILENO);
            libc::close(fd);
        },
        Err(err) => {
            eprintln!("cockpit-bridge: recvmsg(stdin) failed: {}", err);
            std::process::exit(1);
        }
    }
}

fn set_fallback_env(key: &str, value: &str) {
    if std::env::var_os(key).map_or(true, |v| v.is_empty()) {
        std::env::set_var(key, value);
    }
}

/// USER, HOME and SHELL from the effective user's passwd entry when
/// they are not already set.
fn setup_user_env() {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0u8; 8192];

    let rc = unsafe {
        libc::getpwuid_r(
            libc::geteuid(),
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };

    if rc != 0 || result.is_null() {
        warn!("couldn't get user info");
        return;
    }

    let field = |ptr: *const libc::c_char| -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        unsafe {
            std::ffi::CStr::from_ptr(ptr)
                .to_str()
                .ok()
                .map(str::to_owned)
        }
    };

    if let Some(name) = field(pwd.pw_name) {
        set_fallback_env("USER", &name);
    }
    if let Some(dir) = field(pwd.pw_dir) {
        set_fallback_env("HOME", &dir);
    }
    if let Some(shell) = field(pwd.pw_shell) {
        set_fallback_env("SHELL", &shell);
    }
}

fn print_version() {
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Protocol: 1");

    print!("Payloads: ");
    let mut offset = 10;
    for name in cockpit_bridge::channel::payload_names() {
        if offset + name.len() > 70 {
            println!();
            offset = 0;
        }
        if offset == 0 {
            print!("    ");
            offset = 4;
        }
        print!("{} ", name);
        offset += name.len() + 1;
    }
    println!();

    println!("Authorization: crypt1");
}

async fn print_rules() {
    let packages = match Packages::new(packages::Config::from_env()).await {
        Ok(packages) => packages,
        Err(err) => {
            eprintln!("cockpit-bridge: {}", err);
            std::process::exit(1);
        }
    };

    let (_transport, tx) =
        Transport::new(tokio::io::empty(), tokio::io::sink(), Framing::LengthPrefixed);
    let ctx = Rc::new(Context {
        pool: Pool::new(),
        packages: Some(packages.clone()),
    });
    let router = Router::new(tx, ctx, true);
    router.set_rules(&packages.bridges());

    for rule in router.dump_rules() {
        println!("{}", rule);
    }
}

async fn run_bridge(options: &Options) -> i32 {
    setup_user_env();
    set_fallback_env(
        "PATH",
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
    );

    // The bridge runs from within the runtime dir, which makes it
    // easy to create user sockets and files.
    if !options.privileged {
        if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                warn!("couldn't create runtime dir: {:?}: {}", dir, err);
            } else if let Err(err) = std::env::set_current_dir(&dir) {
                warn!("couldn't change to runtime dir: {:?}: {}", dir, err);
            }
        }
    }

    let interactive = options.interact.is_some();

    let mut dbus_daemon = None;
    let mut ssh_agent = None;
    if !interactive && !options.privileged {
        dbus_daemon = helper::start_dbus_daemon().await;
        ssh_agent = helper::start_ssh_agent().await;
    }

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("signal");
    let mut sigint =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).expect("signal");

    let packages = if options.privileged {
        None
    } else {
        match Packages::new(packages::Config::from_env()).await {
            Ok(packages) => Some(packages),
            Err(err) => {
                eprintln!("cockpit-bridge: couldn't scan packages: {}", err);
                return 1;
            }
        }
    };

    let ctx = Rc::new(Context {
        pool: Pool::new(),
        packages: packages.clone(),
    });

    let framing = match options.interact {
        Some(ref boundary) => Framing::Boundary {
            boundary: boundary.clone(),
            color: std::io::stdout().is_terminal(),
        },
        None => Framing::LengthPrefixed,
    };

    let (mut transport, tx) = Transport::new(tokio::io::stdin(), tokio::io::stdout(), framing);

    // In interactive mode pretend we already received an init message,
    // and don't print one out.
    let mut router = Router::new(tx.clone(), ctx, interactive);

    if let Some(ref packages) = packages {
        router.set_rules(&packages.bridges());
        let rules = router.rules_handle();
        let for_rules = packages.clone();
        packages.on_change(move || rules.set(&for_rules.bridges()));
    }

    if !interactive {
        let mut init = Init::default();
        if let Some(ref packages) = packages {
            init.checksum = packages.checksum();
            let mut block = serde_json::Map::new();
            for name in packages.names() {
                block.insert(name, serde_json::Value::Null);
            }
            init.packages = Some(block);
        }
        init.os_release = os_release::load();
        init.session_id = std::env::var("XDG_SESSION_ID").ok();
        let mut capabilities = serde_json::Map::new();
        capabilities.insert("explicit-superuser".into(), serde_json::Value::Bool(true));
        init.capabilities = Some(capabilities);

        if tx.control(&init.to_value()).await.is_err() {
            return 1;
        }
    }

    let mut terminated = false;

    tokio::select! {
        result = router.run(&mut transport) => {
            if let Err(err) = result {
                warn!("transport failed: {}", err);
            }
        }
        _ = sigterm.recv() => {
            terminated = true;
            router.shutdown().await;
        }
        _ = sigint.recv() => {
            router.shutdown().await;
        }
    }

    if let Some(helper) = dbus_daemon.as_mut() {
        helper.terminate();
    }
    if let Some(helper) = ssh_agent.as_mut() {
        helper.terminate();
    }

    if terminated {
        // Re-raise so the parent observes the right disposition.
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_DFL);
            libc::raise(libc::SIGTERM);
        }
    }

    0
}

fn main() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    // When spawned under sudo or pkexec by the user's copy of the
    // bridge, the first thing that happens is receiving our stderr via
    // the socket that is our stdin.
    if std::env::args().any(|arg| arg == "--privileged") {
        receive_stderr();
    }

    set_fallback_env("LANG", "C.UTF-8");
    std::env::set_var("GSETTINGS_BACKEND", "memory");

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let options = match parse_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("cockpit-bridge: {}", message);
            std::process::exit(1);
        }
    };

    if options.version {
        print_version();
        std::process::exit(0);
    }

    if options.packages {
        packages::dump(packages::Config::from_env());
        std::process::exit(0);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    let local = tokio::task::LocalSet::new();

    if options.rules {
        runtime.block_on(local.run_until(print_rules()));
        std::process::exit(0);
    }

    if options.interact.is_none() && std::io::stdout().is_terminal() {
        eprintln!("cockpit-bridge: no option specified");
        std::process::exit(2);
    }

    let code = runtime.block_on(local.run_until(run_bridge(&options)));
    std::process::exit(code);
}
