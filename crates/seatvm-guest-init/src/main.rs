//! PID 1 for seat guests: bring up networking from the kernel command line and
//! exec the workload.

use seatvm_common::boot::BootNetwork;
use std::os::unix::process::CommandExt;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

const CMDLINE_PATH: &str = "/proc/cmdline";
const COMMAND_FILE: &str = "/etc/seat-init/command";
const FALLBACK_SHELL: &str = "/bin/sh";
const SEARCH_PATH: &str = "/sbin:/bin:/usr/sbin:/usr/bin";

#[derive(Error, Debug)]
enum InitError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error("Failed to exec {program}: {source}")]
    Exec {
        program: String,
        source: std::io::Error,
    },
}

type Step = Vec<String>;

fn step(args: &[&str]) -> Step {
    args.iter().map(|s| s.to_string()).collect()
}

/// Commands that configure the guest with iproute2.
fn ip_plan(net: &BootNetwork) -> Vec<Step> {
    let mut plan = vec![
        step(&["ip", "link", "set", "lo", "up"]),
        step(&["ip", "link", "set", &net.device, "up"]),
        step(&["ip", "addr", "add", &net.client_cidr(), "dev", &net.device]),
    ];
    if let Some(gateway) = net.gateway {
        plan.push(step(&[
            "ip",
            "route",
            "add",
            "default",
            "via",
            &gateway.to_string(),
            "dev",
            &net.device,
        ]));
    }
    plan
}

/// The same with net-tools, for images without `ip`.
fn legacy_plan(net: &BootNetwork) -> Vec<Step> {
    let mut plan = vec![
        step(&["ifconfig", "lo", "up"]),
        step(&[
            "ifconfig",
            &net.device,
            &net.client_ip.to_string(),
            "netmask",
            &net.netmask.to_string(),
            "up",
        ]),
    ];
    if let Some(gateway) = net.gateway {
        plan.push(step(&[
            "route",
            "add",
            "default",
            "gw",
            &gateway.to_string(),
            &net.device,
        ]));
    }
    plan
}

/// One argument per line. Blank trailing lines are ignored.
fn parse_command(contents: &str) -> Vec<String> {
    let mut args: Vec<String> = contents.lines().map(str::to_string).collect();
    while args.last().is_some_and(|a| a.is_empty()) {
        args.pop();
    }
    args
}

fn has_program(name: &str) -> bool {
    SEARCH_PATH
        .split(':')
        .any(|dir| Path::new(dir).join(name).exists())
}

async fn run_step(args: &Step) -> Result<(), InitError> {
    let (program, rest) = args.split_first().ok_or_else(|| InitError::Command {
        command: String::new(),
        message: "empty command".to_string(),
    })?;
    let output = Command::new(program)
        .args(rest)
        .env("PATH", SEARCH_PATH)
        .output()
        .await?;
    if !output.status.success() {
        return Err(InitError::Command {
            command: args.join(" "),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

async fn mount_pseudo_filesystems() {
    for (fstype, target, probe) in [("proc", "/proc", "/proc/self"), ("sysfs", "/sys", "/sys/class")] {
        if Path::new(probe).exists() {
            continue;
        }
        if let Err(e) = run_step(&step(&["mount", "-t", fstype, fstype, target])).await {
            warn!(error = %e, "Failed to mount {}", target);
        }
    }
}

async fn configure_network(net: &BootNetwork) {
    let plan = if has_program("ip") {
        ip_plan(net)
    } else {
        warn!("`ip` not found, using ifconfig/route");
        legacy_plan(net)
    };
    for args in &plan {
        // Keep going: a missing route still leaves the guest reachable on the bridge.
        if let Err(e) = run_step(args).await {
            error!(error = %e, "Network step failed");
        }
    }
    info!(
        device = %net.device,
        address = %net.client_cidr(),
        gateway = ?net.gateway,
        "Network configured"
    );
}

fn workload() -> Vec<String> {
    match std::fs::read_to_string(COMMAND_FILE) {
        Ok(contents) => {
            let args = parse_command(&contents);
            if args.is_empty() {
                vec![FALLBACK_SHELL.to_string()]
            } else {
                args
            }
        }
        Err(_) => vec![FALLBACK_SHELL.to_string()],
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), InitError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    mount_pseudo_filesystems().await;

    let cmdline = tokio::fs::read_to_string(CMDLINE_PATH).await.unwrap_or_default();
    let net = BootNetwork::from_cmdline(&cmdline).unwrap_or_else(|| {
        warn!("No ip= parameter on the kernel command line, using fallback address");
        BootNetwork::fallback()
    });
    configure_network(&net).await;

    let args = workload();
    info!(command = ?args, "Handing off to workload");
    let (program, rest) = args
        .split_first()
        .map(|(p, r)| (p.clone(), r.to_vec()))
        .unwrap_or_else(|| (FALLBACK_SHELL.to_string(), Vec::new()));

    // Only returns on failure.
    let source = std::process::Command::new(&program)
        .args(&rest)
        .env("PATH", SEARCH_PATH)
        .exec();
    Err(InitError::Exec { program, source })
}
