// Copyright 2025 Google LLC
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
use clap::{Parser, Subcommand};
use ext_proc::{
    config::ServerConfig,
    options::ProcessingOptions,
    processor::Processor,
    processors::{
        data::DataProcessor, dedup::DedupProcessor, digest::DigestProcessor, echo::EchoProcessor,
        masker::MaskerProcessor, noop::NoopProcessor, timer::TimerProcessor,
        trivial::TrivialProcessor,
    },
    server::CalloutServer,
};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ext-proc-server")]
#[command(about = "Envoy external processing server", long_about = None)]
struct Cli {
    /// Port of the plaintext gRPC listener
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// JSON file with server settings
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log the opening and closing of every stream
    #[arg(long, global = true)]
    log_stream: bool,

    /// Log every phase message and its reply
    #[arg(long, global = true)]
    log_phases: bool,

    /// Append the processor name to x-extproc-names on responses
    #[arg(long, global = true)]
    update_extproc_header: bool,

    /// Report callback time in x-extproc-duration-ns on responses
    #[arg(long, global = true)]
    update_duration_header: bool,

    #[command(subcommand)]
    processor: Processors,
}

#[derive(Subcommand)]
enum Processors {
    /// Continue every phase unchanged
    Noop,
    /// Mark requests and responses with a "seen" header
    Trivial,
    /// Add start, finish and upstream duration headers
    Timer,
    /// Carry a per-request UUID from request to response
    Data,
    /// Add a SHA-256 digest of method, path and body
    Digest,
    /// Reject duplicate in-flight PUT/POST/PATCH requests with 409
    Dedup,
    /// Mask JSON body fields
    Masker,
    /// Answer /echo/ requests with their own headers and body
    Echo,
}

impl Cli {
    fn flags(&self) -> ProcessingOptions {
        ProcessingOptions {
            log_stream: self.log_stream,
            log_phases: self.log_phases,
            update_extproc_header: self.update_extproc_header,
            update_duration_header: self.update_duration_header,
            ..Default::default()
        }
    }

    fn server_config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(port) = self.port {
            config = config.with_plaintext_port(port);
        }
        Ok(config)
    }
}

async fn serve<P: Processor>(
    server: CalloutServer,
    processor: P,
    flags: &ProcessingOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = processor.options().merge_flags(flags);
    info!("Serving the {} processor with {:?}", processor.name(), options);
    server.run(Arc::new(processor), options).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = CalloutServer::new(cli.server_config()?);
    let flags = cli.flags();

    match cli.processor {
        Processors::Noop => serve(server, NoopProcessor, &flags).await,
        Processors::Trivial => serve(server, TrivialProcessor, &flags).await,
        Processors::Timer => serve(server, TimerProcessor, &flags).await,
        Processors::Data => serve(server, DataProcessor, &flags).await,
        Processors::Digest => serve(server, DigestProcessor, &flags).await,
        Processors::Dedup => serve(server, DedupProcessor::default(), &flags).await,
        Processors::Masker => serve(server, MaskerProcessor::default(), &flags).await,
        Processors::Echo => serve(server, EchoProcessor::new()?, &flags).await,
    }
}
