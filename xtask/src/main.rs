use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::env;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{exit, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(author, version, about = "Developer tasks for the Quillhub backend")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    #[command(about = "Run `cargo fmt --all`")]
    Fmt,
    #[command(about = "Run format + clippy lint checks")]
    Lint,
    #[command(about = "Execute `cargo test --workspace`")]
    Test,
    #[command(about = "Run fmt + clippy + test sequence")]
    Ci,
    #[command(about = "Boot the server and check login, refresh and `/metrics`")]
    CiAuthSmoke,
}

fn main() {
    let cli = Cli::parse();

    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(|p| p.to_path_buf())
        .expect("workspace root");

    let result = match cli.command {
        Task::Fmt => run_commands(&workspace_root, [("cargo", &["fmt", "--all"])]),
        Task::Lint => run_commands(
            &workspace_root,
            [
                ("cargo", &["fmt", "--all", "--", "--check"]),
                ("cargo", &["clippy", "--workspace", "--", "-D", "warnings"]),
            ],
        ),
        Task::Test => run_commands(&workspace_root, [("cargo", &["test", "--workspace"])]),
        Task::Ci => run_ci(&workspace_root),
        Task::CiAuthSmoke => run_ci_auth_smoke(&workspace_root),
    };

    if !result {
        exit(1);
    }
}

fn run_ci(workspace_root: &PathBuf) -> bool {
    if !run_commands(
        workspace_root,
        [
            ("cargo", &["fmt", "--all", "--", "--check"]),
            ("cargo", &["clippy", "--workspace", "--", "-D", "warnings"]),
        ],
    ) {
        return false;
    }
    run_commands(workspace_root, [("cargo", &["test", "--workspace"])])
}

fn run_ci_auth_smoke(workspace_root: &PathBuf) -> bool {
    if !run_commands(
        workspace_root,
        [(
            "cargo",
            &["build", "--features", "metrics", "-p", "quillhub-server"],
        )],
    ) {
        return false;
    }

    let port = match reserve_port() {
        Some(port) => port,
        None => {
            eprintln!("failed to reserve a free TCP port");
            return false;
        }
    };
    let bind_addr = format!("127.0.0.1:{port}");

    let mut child = match Command::new("cargo")
        .args([
            "run",
            "--quiet",
            "--features",
            "metrics",
            "-p",
            "quillhub-server",
            "--",
            "--bind-addr",
            &bind_addr,
            "--metrics-enabled",
            "true",
        ])
        .env("RUST_LOG", "warn")
        .current_dir(workspace_root)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            eprintln!("failed to launch quillhub-server: {err}");
            return false;
        }
    };

    let result = match Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => {
            let base_url = format!("http://{bind_addr}");
            if !wait_for_ready(&client, &format!("{base_url}/ready"), Duration::from_secs(30)) {
                eprintln!("server did not become ready within the timeout");
                false
            } else {
                verify_rejected_login(&client, &base_url)
                    && verify_refresh_requires_cookie(&client, &base_url)
                    && verify_metrics(&client, &format!("{base_url}/metrics"))
            }
        }
        Err(err) => {
            eprintln!("failed to build HTTP client: {err}");
            false
        }
    };

    if let Err(err) = child.kill() {
        if err.kind() != std::io::ErrorKind::InvalidInput {
            eprintln!("failed to terminate server process: {err}");
        }
    }
    let _ = child.wait();

    result
}

fn reserve_port() -> Option<u16> {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .ok()
}

fn wait_for_ready(client: &Client, url: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match client.get(url).send() {
            Ok(response) if response.status().is_success() => return true,
            Ok(_) | Err(_) => sleep(Duration::from_millis(500)),
        }
    }
    false
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginBody<'a> {
    login_or_email: &'a str,
    password: &'a str,
}

fn verify_rejected_login(client: &Client, base_url: &str) -> bool {
    let body = LoginBody {
        login_or_email: "smoke-test",
        password: "not-a-password",
    };
    match client
        .post(format!("{base_url}/auth/login"))
        .json(&body)
        .send()
    {
        Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
            if response.headers().contains_key("set-cookie") {
                eprintln!("rejected login must not set a refresh cookie");
                return false;
            }
            match response.json::<Value>() {
                Ok(payload) if payload["error"] == "unauthorized" => true,
                Ok(payload) => {
                    eprintln!("unexpected login error body: {payload}");
                    false
                }
                Err(err) => {
                    eprintln!("failed to decode login error body: {err}");
                    false
                }
            }
        }
        Ok(response) => {
            eprintln!("unexpected login response status: {}", response.status());
            false
        }
        Err(err) => {
            eprintln!("failed to call login endpoint: {err}");
            false
        }
    }
}

fn verify_refresh_requires_cookie(client: &Client, base_url: &str) -> bool {
    match client.post(format!("{base_url}/auth/refresh-token")).send() {
        Ok(response) if response.status() == StatusCode::UNAUTHORIZED => true,
        Ok(response) => {
            eprintln!(
                "refresh without cookie answered {} instead of 401",
                response.status()
            );
            false
        }
        Err(err) => {
            eprintln!("failed to call refresh endpoint: {err}");
            false
        }
    }
}

fn verify_metrics(client: &Client, url: &str) -> bool {
    const EXPECTED: [&str; 2] = [
        "quillhub_http_requests_total{route=\"/auth/login\",status=\"401\"}",
        "quillhub_auth_events_total{event=\"login_rejected\"}",
    ];

    match client.get(url).send() {
        Ok(response) if response.status() == StatusCode::OK => match response.text() {
            Ok(body) => {
                let missing: Vec<_> = EXPECTED
                    .iter()
                    .filter(|series| !body.contains(*series))
                    .collect();
                if missing.is_empty() {
                    true
                } else {
                    eprintln!("metrics endpoint is missing series: {missing:?}");
                    false
                }
            }
            Err(err) => {
                eprintln!("failed to read metrics body: {err}");
                false
            }
        },
        Ok(response) => {
            eprintln!("unexpected metrics response status: {}", response.status());
            false
        }
        Err(err) => {
            eprintln!("failed to call metrics endpoint: {err}");
            false
        }
    }
}

fn run_commands<const N: usize>(
    workspace_root: &PathBuf,
    commands: [(&str, &[&str]); N],
) -> bool {
    for (program, args) in commands {
        let status = Command::new(program)
            .args(args)
            .current_dir(workspace_root)
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                eprintln!("command '{program} {}' failed with {status}", args.join(" "));
                return false;
            }
            Err(err) => {
                eprintln!("failed to spawn '{program}': {err}");
                return false;
            }
        }
    }
    true
}
