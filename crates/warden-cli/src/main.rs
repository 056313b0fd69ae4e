mod args;
mod client;
mod output;

use anyhow::Result;
use clap::Parser;
use reqwest::Client;
use serde_json::{json, Value};

use crate::args::{Args, Command};
use crate::client::{auth, parse_params, url};
use crate::output::{print_execute, print_stats};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::new();
    let token = args.token;

    match args.command {
        Command::Execute {
            target,
            tenant,
            params,
            request_id,
        } => {
            let mut body = json!({
                "tenantId": tenant,
                "actionTarget": target,
                "parameters": parse_params(&params)?,
            });
            if let Some(id) = request_id {
                body["requestId"] = json!(id);
            }
            let resp = auth(client.post(url(&args.gateway_url, "/execute")), token.as_ref())
                .json(&body)
                .send()
                .await?;
            let status = resp.status();
            let text = resp.text().await?;
            match serde_json::from_str::<Value>(&text) {
                Ok(v) => print_execute(status.as_u16(), &v),
                Err(_) => eprintln!("✗ [{}] {}", status.as_u16(), text),
            }
            if !status.is_success() {
                std::process::exit(1);
            }
        }
        Command::Invalidate { target, version } => {
            let mut body = json!({ "actionTarget": target });
            if let Some(v) = version {
                body["version"] = json!(v);
            }
            let resp = auth(
                client.post(url(&args.gateway_url, "/cache/invalidate")),
                token.as_ref(),
            )
            .json(&body)
            .send()
            .await?;
            if resp.status().is_success() {
                let v: Value = resp.json().await?;
                println!("✓ Removed {} cached result(s)", v["removed"].as_u64().unwrap_or(0));
            } else {
                eprintln!("✗ Failed to invalidate: {}", resp.text().await?);
            }
        }
        Command::Stats { json } => {
            let resp = auth(client.get(url(&args.gateway_url, "/stats")), token.as_ref())
                .send()
                .await?;
            if resp.status().is_success() {
                let stats: Value = resp.json().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                } else {
                    print_stats(&stats);
                }
            } else {
                eprintln!("✗ Failed to fetch stats: {}", resp.text().await?);
            }
        }
        Command::Health => {
            let resp = client.get(url(&args.gateway_url, "/health")).send().await?;
            let healthy = resp.status().is_success();
            let body: Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            if !healthy {
                std::process::exit(1);
            }
        }
        Command::Metrics => {
            let text = client
                .get(url(&args.gateway_url, "/metrics"))
                .send()
                .await?
                .text()
                .await?;
            println!("{text}");
        }
    }

    Ok(())
}
