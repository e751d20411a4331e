//! mux-gate command line tool
//!
//! Serves a small built-in application over every protocol the front end
//! resolves, which makes it a convenient probe for clients and proxies.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Request, StatusCode};
use log::{debug, info, warn};

use mux_gate::common::{init_logger, Result};
use mux_gate::config::{self, parse_protocol_list, ConfigValues};
use mux_gate::server::DefaultHandler;
use mux_gate::session::H2Engine;
use mux_gate::tls::get_cert_fingerprint;
use mux_gate::web::{Application, HttpHandler, RequestExt, ServerResponse};
use mux_gate::{parse_socket_addr, Server, APP_NAME, VERSION};

/// mux-gate: protocol-detecting front end for SPDY, HTTP/2 and HTTP/1.x
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Load configuration from a file
    #[clap(long)]
    config_file: Option<PathBuf>,

    /// Listen address
    #[clap(short, long)]
    listen: Option<String>,

    /// Terminate TLS (true/false)
    #[clap(long)]
    ssl: Option<bool>,

    /// Sniff plaintext connections for SPDY and HTTP/2
    #[clap(long)]
    plain: bool,

    /// Offered protocols, comma separated, in preference order
    #[clap(long)]
    protocols: Option<String>,

    /// Protocol used when negotiation yields nothing
    #[clap(long)]
    default_protocol: Option<String>,

    /// Server certificate path
    #[clap(long)]
    cert: Option<PathBuf>,

    /// Server private key path
    #[clap(long)]
    key: Option<PathBuf>,

    /// Log level
    #[clap(long)]
    log_level: Option<String>,

    /// Time a plaintext peer gets to send classifiable bytes, in milliseconds
    #[clap(long)]
    detect_timeout: Option<u64>,

    /// Largest accepted HTTP/1 request head, in bytes
    #[clap(long)]
    max_header_size: Option<usize>,

    /// Largest accepted HTTP/1 request body, in bytes
    #[clap(long)]
    max_body_size: Option<usize>,

    /// Add x-forwarded-for to requests carried by multiplexed streams
    #[clap(long)]
    x_forwarded_for: bool,
}

impl Args {
    fn into_values(self) -> Result<(Option<PathBuf>, ConfigValues)> {
        let listen = match self.listen {
            Some(listen) => Some(parse_socket_addr(&listen)?),
            None => None,
        };

        let values = ConfigValues {
            listen,
            ssl: self.ssl,
            plain: self.plain.then_some(true),
            protocols: self.protocols.as_deref().map(parse_protocol_list),
            default_protocol: self.default_protocol,
            cert: self.cert,
            key: self.key,
            log_level: self.log_level,
            detect_timeout: self.detect_timeout,
            max_header_size: self.max_header_size,
            max_body_size: self.max_body_size,
            x_forwarded_for: self.x_forwarded_for.then_some(true),
            ..ConfigValues::default()
        };

        Ok((self.config_file, values))
    }
}

/// Built-in application describing how each request arrived
struct Describe;

impl Application for Describe {
    async fn call(&self, request: Request<Bytes>, response: &mut ServerResponse<'_>) -> Result<()> {
        let protocol = request.protocol();

        if protocol.multiplexed && request.uri().path() == "/" {
            match response.push("/mux-gate.json", HeaderMap::new()) {
                Ok(mut pushed) => {
                    let mut headers = HeaderMap::new();
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    pushed.write_head(StatusCode::OK, headers)?;
                    pushed.write(format!("{{\"name\":\"{}\",\"version\":\"{}\"}}", APP_NAME, VERSION).as_bytes()).await?;
                    pushed.end().await?;
                }
                Err(e) => debug!("Push refused: {}", e),
            }
        }

        let body = serde_json::json!({
            "method": request.method().as_str(),
            "path": request.uri().path(),
            "multiplexed": protocol.multiplexed,
            "version": protocol.version,
            "stream": request.stream_handle().map(|handle| handle.stream_id()),
            "body_bytes": request.body().len(),
        });

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response.write_head(StatusCode::OK, headers)?;
        response.end(format!("{}\n", body).as_bytes()).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let (config_file, cli) = args.into_values()?;

    let config = config::load(config_file.as_deref(), cli)?;

    init_logger(config.log_level());
    info!("Starting {} v{}", APP_NAME, VERSION);
    config.log();

    if config.ssl() {
        match get_cert_fingerprint(config.cert()) {
            Ok(fingerprint) => info!("Certificate fingerprint: {}", fingerprint),
            Err(e) => warn!("Unable to get certificate fingerprint: {}", e),
        }
    }

    let config = Arc::new(config);
    let handler: Arc<dyn DefaultHandler> = Arc::new(
        HttpHandler::new(Describe, config.max_header_size()).with_max_body_size(config.max_body_size()),
    );
    let server = Server::new(config, H2Engine::new(), vec![handler])?;

    let handle = server.start().await?;
    info!("Ready on {}, press Ctrl+C to stop", handle.local_addr());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Unable to listen for Ctrl+C: {}", e);
            }
            info!("Shutting down");
            handle.shutdown().await?;
        }
        _ = handle.stopped() => {}
    }

    Ok(())
}
