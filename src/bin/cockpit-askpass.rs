//! The askpass helper, used by the bridge during password prompts.
//!
//! Stdin is expected to be a socketpair; the challenge is written
//! there as an `authorize` control message and the password from the
//! reply is printed on stdout. No `init` message is exchanged: the
//! caller either sent one already or makes an exception for the
//! `authorize` command.

use std::io::{IsTerminal, Read, Write};

use cockpit_bridge::session;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let prompt = args.next().unwrap_or_else(|| "Password: ".to_string());
    if args.next().is_some() {
        eprintln!("cockpit-askpass: too many arguments");
        std::process::exit(2);
    }

    if std::io::stdin().is_terminal() {
        eprintln!("cockpit-askpass: this command is not meant to be run directly");
        std::process::exit(2);
    }

    let user = std::env::var("USER").unwrap_or_default();

    let mut stdin = Stdin;
    let mut password = match session::askpass(&mut stdin, &user, &prompt) {
        Ok(password) => password,
        Err(err) => {
            eprintln!("cockpit-askpass: {}", err);
            std::process::exit(1);
        }
    };

    // The password goes to stdout, followed by a newline.
    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    let result = stdout
        .write_all(password.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush());

    password.clear();

    if result.is_err() {
        std::process::exit(1);
    }
}

/// Both directions of the exchange run on fd 0, which is a socketpair.
struct Stdin;

impl std::io::Read for Stdin {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::stdin().lock().read(buf)
    }
}

impl std::io::Write for Stdin {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = unsafe {
            libc::write(
                libc::STDIN_FILENO,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if written < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(written as usize)
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
