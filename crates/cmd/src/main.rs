// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use jiff::SignedDuration;
use pixload_common_runtime::{GlobalRuntimeOptions, block_on_delivery, init_global_runtimes};
use pixload_common_telemetry::{LogFormat, LoggingOptions, init_global_logging, set_panic_hook};
use pixload_downloader::{
    Downloader, DownloaderConfig, FetchContext, FetchError, FetchEvent, FetchEvents,
    FetchOptions, Priority, base64_decryptor,
};
use pixload_error::{ErrorExt, StatusCode};
use snafu::{ResultExt, Snafu, Whatever};
use tracing::{info, warn};

const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");

#[derive(Debug, Parser)]
#[clap(
name = "pixload",
about = "Concurrent image fetcher",
author = AUTHOR,
version)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    /// Worker threads for transfers (default: one per CPU)
    #[arg(long, global = true)]
    transfer_threads: Option<usize>,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Clone, Args)]
struct LoggingArgs {
    /// Log filter, e.g. `info` or `debug,reqwest=warn`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Also write hourly rotated log files here
    #[arg(long, global = true)]
    log_dir: Option<String>,
}

impl LoggingArgs {
    fn options(&self) -> LoggingOptions {
        LoggingOptions::builder()
            .maybe_level(self.log_level.clone())
            .log_format(if self.json_logs {
                LogFormat::Json
            } else {
                LogFormat::Text
            })
            .dir(self.log_dir.clone().unwrap_or_default())
            .build()
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Fetch(FetchArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Fetch one or more images concurrently.
Examples:

pixload fetch https://example.com/a.png https://example.com/b.jpg -o out
pixload fetch --priority high --header 'Referer:https://example.com' URL

")]
struct FetchArgs {
    #[arg(required = true)]
    urls: Vec<String>,

    /// Directory to write payloads to; nothing is written without it
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, default_value = "normal")]
    priority: Priority,

    /// Report partial payloads while they arrive
    #[arg(long)]
    progressive: bool,

    #[arg(long, default_value_t = 6)]
    max_concurrent: usize,

    /// Share one transfer between identical URLs
    #[arg(long)]
    coalesce: bool,

    /// Extra request header as `Name:Value`; repeatable
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Payloads are base64 text; decode them before saving
    #[arg(long)]
    base64: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 15)]
    timeout: i64,

    #[arg(long)]
    user_agent: Option<String>,

    /// Accept invalid TLS certificates
    #[arg(long)]
    insecure: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected Name:Value, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[derive(Debug, Snafu)]
enum FetchFailure {
    #[snafu(display("{}", source.output_msg()))]
    Fetch { source: FetchError },

    #[snafu(display("Failed to write {}", path.display()))]
    Write {
        path:   PathBuf,
        source: std::io::Error,
    },
}

impl FetchFailure {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Fetch { source } => source.status_code().exit_code(),
            Self::Write { .. } => StatusCode::Internal.exit_code(),
        }
    }
}

impl FetchArgs {
    fn config(&self) -> DownloaderConfig {
        DownloaderConfig::builder()
            .max_concurrent_downloads(self.max_concurrent)
            .coalesce_requests(self.coalesce)
            .timeout(SignedDuration::from_secs(self.timeout))
            .maybe_user_agent(self.user_agent.clone())
            .minimum_progress_interval(0.1)
            .build()
    }

    fn options(&self) -> FetchOptions {
        FetchOptions::builder()
            .priority(self.priority)
            .progressive(self.progressive)
            .allow_invalid_tls(self.insecure)
            .build()
    }

    fn context(&self) -> FetchContext {
        if self.base64 {
            FetchContext::builder().decryptor(base64_decryptor()).build()
        } else {
            FetchContext::default()
        }
    }

    async fn run(&self) -> Result<ExitCode, Whatever> {
        let downloader = Downloader::new(self.config());
        for (name, value) in &self.headers {
            downloader
                .set_header(name, Some(value))
                .whatever_context(format!("invalid header {name}"))?;
        }
        if let Some(dir) = &self.output {
            tokio::fs::create_dir_all(dir)
                .await
                .whatever_context(format!("failed to create {}", dir.display()))?;
        }

        let fetches = self.urls.iter().enumerate().map(|(index, url)| {
            let events = downloader.fetch_events(url, self.options(), self.context());
            drive(index, url, events, self.output.as_deref())
        });
        let all = futures::future::join_all(fetches);
        tokio::pin!(all);

        let outcomes = tokio::select! {
            outcomes = &mut all => outcomes,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, cancelling all fetches");
                downloader.cancel_all();
                all.await
            }
        };

        let mut exit = 0;
        for (url, outcome) in self.urls.iter().zip(outcomes) {
            match outcome {
                Ok(len) => println!("ok    {url} ({len} bytes)"),
                Err(failure) => {
                    println!("error {url}: {failure}");
                    if exit == 0 {
                        exit = failure.exit_code();
                    }
                }
            }
        }
        info!(
            fetched = self.urls.len(),
            exit_code = exit,
            "all fetches settled"
        );
        Ok(ExitCode::from(u8::try_from(exit).unwrap_or(1)))
    }
}

/// Follow one fetch to completion, printing progress and saving the payload.
async fn drive(
    index: usize,
    url: &str,
    mut events: FetchEvents,
    output: Option<&Path>,
) -> Result<usize, FetchFailure> {
    while let Some(event) = events.next().await {
        match event {
            FetchEvent::Progress { received, expected } => match expected {
                Some(total) => eprintln!("{url}: {received}/{total} bytes"),
                None => eprintln!("{url}: {received} bytes"),
            },
            FetchEvent::Partial(payload) => {
                eprintln!("{url}: partial image, {} bytes", payload.data.len());
            }
            FetchEvent::Finished(result) => {
                let payload = result.context(FetchSnafu)?;
                if let Some(dir) = output {
                    let path = dir.join(file_name(index, url));
                    tokio::fs::write(&path, &payload.data)
                        .await
                        .context(WriteSnafu { path: &path })?;
                    info!(url, path = %path.display(), "payload saved");
                }
                return Ok(payload.data.len());
            }
        }
    }
    Err(FetchError::Cancelled).context(FetchSnafu)
}

/// Last path segment of `url`, prefixed by its position so duplicate names
/// don't overwrite each other.
fn file_name(index: usize, url: &str) -> String {
    let name = url
        .split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("payload");
    format!("{index:03}-{name}")
}

fn main() -> Result<ExitCode, Whatever> {
    let cli = Cli::parse();
    let _guards = init_global_logging(&cli.logging.options());
    set_panic_hook();

    let runtimes = GlobalRuntimeOptions::builder()
        .maybe_transfer_threads(cli.transfer_threads)
        .build();
    init_global_runtimes(&runtimes).whatever_context("failed to start runtimes")?;

    match cli.commands {
        Commands::Fetch(args) => block_on_delivery(args.run()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers() {
        assert_eq!(
            parse_header("Referer: https://example.com").unwrap(),
            ("Referer".to_string(), "https://example.com".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(":value").is_err());
    }

    #[test]
    fn file_names_keep_the_last_segment() {
        assert_eq!(file_name(0, "https://a.test/img/cat.png?size=2"), "000-cat.png");
        assert_eq!(file_name(12, "https://a.test/"), "012-payload");
    }

    #[test]
    fn cli_maps_flags_to_options() {
        let cli = Cli::try_parse_from([
            "pixload",
            "--json-logs",
            "fetch",
            "https://a.test/x.png",
            "--priority",
            "high",
            "--header",
            "X-Trace:1",
            "--coalesce",
            "--timeout",
            "3",
            "--base64",
        ])
        .unwrap();
        assert_eq!(cli.logging.options().log_format, LogFormat::Json);

        let Commands::Fetch(args) = cli.commands;
        assert_eq!(args.options().priority, Priority::High);
        assert_eq!(args.headers, vec![("X-Trace".to_string(), "1".to_string())]);

        let config = args.config();
        assert!(config.coalesce_requests);
        assert_eq!(config.timeout, SignedDuration::from_secs(3));
        assert!(args.context().decryptor.is_some());
    }

    #[tokio::test]
    async fn failed_fetch_sets_exit_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = FetchArgs {
            urls:           vec![format!("file://{}/missing.png", dir.path().display())],
            output:         None,
            priority:       Priority::Normal,
            progressive:    false,
            max_concurrent: 2,
            coalesce:       false,
            headers:        Vec::new(),
            base64:         false,
            timeout:        5,
            user_agent:     None,
            insecure:       false,
        };
        let downloader = Downloader::new(args.config());
        let events = downloader.fetch_events(&args.urls[0], args.options(), args.context());
        let failure = drive(0, &args.urls[0], events, None).await.unwrap_err();
        assert_eq!(failure.exit_code(), StatusCode::Unavailable.exit_code());
    }
}
