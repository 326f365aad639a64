//! Role-addressed machine management with a declarative target config.
//!
//! Run with: cargo run --example lifecycle

use testrig::machine::ShellMachine;
use testrig::{Config, Context, ContextConfig, RequestOpts};

const TARGETS: &str = r#"{
    "targets": {
        "localhost": {
            "roles": ["target", "builder"],
            "connector": {
                "type": "pty",
                "program": "bash",
                "args": ["--norc", "--noprofile", "--noediting", "-i"]
            }
        }
    }
}"#;

fn main() -> testrig::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config: Config = serde_json::from_str(TARGETS).expect("invalid target config");
    let ctx = Context::new(ContextConfig {
        keep_alive: true,
        reset_on_error: true,
    });
    config.register_machines(&ctx)?;

    let scope = ctx.enter();

    // The machine connects on first request and is reused afterwards.
    let hostname = ctx.request_with("target", &RequestOpts::default(), |guard| {
        guard.with(|m: &mut ShellMachine| -> testrig::Result<String> {
            m.shell()?.exec0("hostname")
        })?
    })?;
    println!("target is {}", hostname.trim());

    let nproc = ctx.request_with("builder", &RequestOpts::default(), |guard| {
        guard.with(|m: &mut ShellMachine| -> testrig::Result<String> {
            m.shell()?.exec0("nproc")
        })?
    })?;
    println!("builder has {} cpus", nproc.trim());

    // Scope exit tears everything down in reverse initialization order.
    drop(scope);
    Ok(())
}
