//! Mutual-TLS HTTPS GET with a client key held in the TPM
//!
//! cargo run --example mtls_client -- --handle 0x81010002 --cert client.pem \
//!     --ca ca.pem --host server.example --port 8443

use anyhow::Context;
use clap::Parser;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tpm_tls::api::{load_certificate_chain, CredentialConfig, Handle, KeySource, PeerConfig, SignatureScheme};

#[derive(Parser, Debug)]
struct Args {
    /// Persistent handle of the client key
    #[arg(long)]
    handle: Handle,

    /// Client certificate matching the key
    #[arg(long)]
    cert: PathBuf,

    /// CA that signed the server certificate
    #[arg(long)]
    ca: PathBuf,

    #[arg(long)]
    host: String,

    #[arg(long, default_value_t = 443)]
    port: u16,

    #[arg(long, default_value = "pss")]
    scheme: SignatureScheme,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let credential = tpm_tls::open_credential(CredentialConfig {
        key: KeySource::handle(args.handle),
        scheme: args.scheme,
        certificate_path: Some(args.cert),
        ..CredentialConfig::default()
    })?;
    if let Some(leaf) = credential.leaf_certificate() {
        eprintln!(
            "client {} ({}), expires {}",
            leaf.subject,
            credential.reference().describe(),
            leaf.not_after
        );
    }

    let (ca, _) = load_certificate_chain(&args.ca)?;
    let mut roots = RootCertStore::empty();
    roots.add(ca.der)?;

    let server_name = ServerName::try_from(args.host.clone()).context("invalid host name")?;
    let tls = credential.tls_config(PeerConfig {
        root_certificates: roots,
        server_name: Some(server_name.clone()),
        ..PeerConfig::default()
    })?;
    eprintln!("offering {:?}", tls.cipher_suites());

    let connection = rustls::ClientConnection::new(Arc::new(tls.client_config()?), server_name)?;
    let socket = TcpStream::connect((args.host.as_str(), args.port))?;
    let mut stream = rustls::StreamOwned::new(connection, socket);

    write!(
        stream,
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        args.host
    )?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    print!("{response}");
    Ok(())
}
