// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use nova::service::setup_tracing;
use nova::{AppResult, NovaServer, Request, Response, ServerConfig, WebSocketHandler, WsSession};
use tokio::{runtime, signal};
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for the rolling log files
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,
    /// log level when RUST_LOG is unset (v: debug, vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

struct Echo;

impl WebSocketHandler for Echo {
    fn on_message(&self, session: &WsSession, text: &str) {
        if let Err(e) = session.send_text(text) {
            error!("echo to session {} failed: {}", session.id(), e);
        }
    }

    fn on_binary(&self, session: &WsSession, data: &bytes::Bytes) {
        let _ = session.send_binary(data.clone());
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }
    let _log_guard = setup_tracing(&commandline.log_dir)?;

    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let config = ServerConfig::set_up_config(config_path)?;

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(async move {
        let server = Arc::new(NovaServer::new(config)?);
        server
            .router()
            .get("/health", |_: &mut Request, res: &mut Response| -> AppResult<()> {
                res.json(serde_json::json!({"status": "ok"}).to_string())
            })?;
        server.ws("/echo", Echo)?;

        let handle = server.shutdown_handle();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, shutting down");
                handle.shutdown();
            }
        });
        server.start().await
    })
}
