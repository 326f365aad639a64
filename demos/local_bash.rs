//! Bring up a managed shell on a local bash and run a few commands.
//!
//! Run with: cargo run --example local_bash

use testrig::channel::{Channel, PtyChannelIO};
use testrig::shell::ShellSession;

fn main() -> testrig::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let io = PtyChannelIO::local_bash(80, 24)?;
    let ch = Channel::new_posix(Box::new(io));
    let shell = ShellSession::setup(ch, "local")?;

    let uname = shell.exec0("uname -a")?;
    println!("kernel: {}", uname.trim());

    let (code, _) = shell.exec("test -e /nonexistent")?;
    println!("missing file probe exited with {code}");

    let proxy = shell.run("for i in 1 2 3; do echo tick $i; sleep 0.1; done")?;
    let line = proxy.readline(None)?;
    println!("first line of output: {}", line.trim());
    let (code, rest) = proxy.terminate()?;
    println!("loop exited with {code}, remaining output:\n{rest}");

    shell.close()
}
