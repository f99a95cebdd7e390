use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tpm_tls::api::{
    read_tss_file, write_tss_file, CredentialConfig, Handle, KeySource, PublicArea,
    SignatureScheme, DEFAULT_TPM_PATH,
};
use tpm_tls::ports::DigestSigner;

#[derive(Parser, Debug)]
#[command(name = "tpmtls")]
#[command(about = "TPM-backed TLS client keys", version)]
pub struct Cli {
    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    /// TPM character device
    #[arg(long, global = true, default_value = DEFAULT_TPM_PATH)]
    pub tpm_path: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Wrap TPM public/private blobs into a TSS2 PEM key file
    CreateTss {
        /// TPM2B_PUBLIC blob as written by tpm2_create -u
        #[arg(long)]
        pub_file: PathBuf,

        /// TPM2B_PRIVATE blob as written by tpm2_create -r
        #[arg(long)]
        key_file: PathBuf,

        /// Parent handle (0x40000001 derives a primary under the owner hierarchy)
        #[arg(long, default_value = "0x40000001")]
        parent: Handle,

        /// Output PEM file
        #[arg(long)]
        out: PathBuf,
    },

    /// Print the fields of a TSS2 PEM key file
    Inspect {
        #[arg(long)]
        tss: PathBuf,
    },

    /// Print the public key of a TPM key as SubjectPublicKeyInfo PEM
    PublicKey {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Sign data provided via stdin (SHA-256), print the signature as hex
    Sign {
        #[command(flatten)]
        key: KeyArgs,

        /// Padding scheme (pss, pkcs1)
        #[arg(long, default_value = "pss")]
        scheme: SignatureScheme,

        /// Leave stale sessions and transient objects in place
        #[arg(long)]
        no_purge: bool,
    },
}

/// Exactly one of these selects the key
#[derive(Args, Debug)]
pub struct KeyArgs {
    /// Persistent handle, e.g. 0x81010002
    #[arg(long)]
    handle: Option<Handle>,

    /// Context file saved with tpm2_evictcontrol / tpm2_contextsave
    #[arg(long)]
    context: Option<PathBuf>,

    /// TSS2 PEM key file
    #[arg(long)]
    tss: Option<PathBuf>,
}

impl KeyArgs {
    fn into_source(self) -> anyhow::Result<KeySource> {
        let container = match &self.tss {
            Some(path) => Some(
                read_tss_file(path).with_context(|| format!("failed to read {}", path.display()))?,
            ),
            None => None,
        };
        Ok(KeySource {
            persistent_handle: self.handle,
            context_file: self.context,
            container,
        })
    }
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let key = read_tss_file(path).with_context(|| format!("failed to read {}", path.display()))?;
    println!("type:       {}", key.key_type);
    println!("empty auth: {}", key.empty_auth);
    println!("parent:     {}", key.parent);
    println!("public:     {} bytes", key.public.len());
    println!("private:    {} bytes", key.private.len());
    match key.public_area().context("failed to parse public area")? {
        PublicArea::Rsa(rsa) => {
            println!("key:        rsa {} bits, exponent {}", rsa.key_bits, rsa.exponent)
        }
        PublicArea::Ecc(ecc) => println!("key:        ecc curve 0x{:04x}", ecc.curve),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::CreateTss {
            pub_file,
            key_file,
            parent,
            out,
        } => {
            let key = tpm_tls::create_tss_key(&pub_file, &key_file, parent)
                .context("failed to build TSS2 key")?;
            write_tss_file(&out, &key).context("failed to write TSS2 key")?;
        }
        Commands::Inspect { tss } => inspect(&tss)?,
        Commands::PublicKey { key } => {
            let public = tpm_tls::read_public_key(&cli.tpm_path, key.into_source()?)
                .context("failed to read public key")?;
            print!("{}", tpm_tls::public_key_pem(&public)?);
        }
        Commands::Sign {
            key,
            scheme,
            no_purge,
        } => {
            let config = CredentialConfig {
                device_path: cli.tpm_path,
                key: key.into_source()?,
                scheme,
                purge_on_start: !no_purge,
                ..CredentialConfig::default()
            };
            let credential = tpm_tls::open_credential(config).context("failed to open credential")?;

            let mut data = Vec::new();
            io::stdin().read_to_end(&mut data)?;
            let digest = Sha256::digest(&data);
            let signature = credential
                .sign(&digest, scheme)
                .context("failed to sign")?;
            println!("{}", hex::encode(signature));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_cmd::Command;

    #[test]
    fn test_cli_version_parameter() {
        let mut cmd = Command::cargo_bin("tpmtls").unwrap();
        let assert = cmd.arg("--version").assert();
        assert.success();
    }

    #[test]
    fn test_cli_unknown_scheme() {
        let mut cmd = Command::cargo_bin("tpmtls").unwrap();
        cmd.args(["sign", "--handle", "0x81000001", "--scheme", "md5"])
            .assert()
            .failure();
    }

    #[test]
    #[cfg_attr(not(feature = "hardware-tests"), ignore)] // Requires TPM hardware - enable with: --features hardware-tests
    fn test_cli_sign_with_persistent_handle() {
        let mut cmd = Command::cargo_bin("tpmtls").unwrap();
        let assert = cmd
            .args(["sign", "--handle", "0x81010002", "--scheme", "pss"])
            .write_stdin("hello")
            .assert();

        let output = assert.get_output();
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            assert!(stdout.trim().chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
