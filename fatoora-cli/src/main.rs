use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fatoora_compliance::audit::TracingAuditSink;
use fatoora_compliance::certificate::InMemoryCertificateStore;
use fatoora_compliance::chain::{GENESIS_HASH, hash_as_submitted, hash_invoice, verify_chain};
use fatoora_compliance::config::EnvironmentType;
use fatoora_compliance::csr::CsrConfig;
use fatoora_compliance::keys::{KeyMaterialService, KeyPair, MasterKey, signing_key_from_pem};
use fatoora_compliance::qr;
use fatoora_compliance::stamp::sign_hash;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "fatoora")]
#[command(about = "Operator tooling for the ZATCA compliance pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a secp256k1 key pair.
    Keygen {
        #[arg(long)]
        private_key: PathBuf,
        /// Write the public key here instead of stdout.
        #[arg(long)]
        public_key: Option<PathBuf>,
        /// Store the private key encrypted under FATOORA_MASTER_KEY.
        #[arg(long)]
        encrypt: bool,
        #[arg(long, default_value = "default")]
        key_id: String,
    },
    /// Build a CSR from a properties file.
    Csr {
        #[arg(long)]
        csr_config: PathBuf,
        /// PEM private key; generated and written here when missing.
        #[arg(long)]
        private_key: PathBuf,
        #[arg(long)]
        generated_csr: Option<PathBuf>,
        #[arg(long, default_value = "non_production")]
        env: String,
        /// Emit PEM rather than the base64 form the gateway expects.
        #[arg(long)]
        pem: bool,
    },
    /// Print the chain hash of an invoice.
    Hash {
        #[arg(long)]
        invoice: PathBuf,
        /// Hash against this previous hash instead of the embedded one.
        #[arg(long)]
        previous_hash: Option<String>,
    },
    /// Sign an invoice hash and print the stamp as JSON.
    Sign {
        #[arg(long)]
        invoice: PathBuf,
        #[arg(long)]
        private_key: PathBuf,
        #[arg(long, default_value = GENESIS_HASH)]
        previous_hash: String,
    },
    /// Check that each invoice embeds the hash of the one before it.
    VerifyChain {
        #[arg(required = true)]
        invoices: Vec<PathBuf>,
    },
    /// Decode a QR payload and print its fields as JSON.
    QrDecode { payload: String },
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

fn key_service(key_id: &str) -> Result<KeyMaterialService> {
    let master = MasterKey::from_env()?;
    Ok(KeyMaterialService::new(
        master,
        key_id,
        Arc::new(InMemoryCertificateStore::new()),
        Arc::new(TracingAuditSink),
    ))
}

fn keygen(
    private_key: &Path,
    public_key: Option<&Path>,
    encrypt: bool,
    key_id: &str,
) -> Result<()> {
    let pair = KeyPair::generate()?;
    if encrypt {
        let service = key_service(key_id)?;
        let sealed = service.encrypt_key_pair(&pair)?;
        write_text(private_key, &serde_json::to_string_pretty(&sealed)?)?;
    } else {
        write_text(private_key, pair.private_pem())?;
    }
    match public_key {
        Some(path) => write_text(path, pair.public_pem())?,
        None => print!("{}", pair.public_pem()),
    }
    info!(encrypted = encrypt, "generated key pair");
    Ok(())
}

fn csr(
    config_path: &Path,
    private_key: &Path,
    generated_csr: Option<&Path>,
    env: &str,
    pem: bool,
) -> Result<()> {
    let env = EnvironmentType::from_str(env)?;
    let config = CsrConfig::from_properties(config_path)?;
    let signer = if private_key.exists() {
        let pem = Zeroizing::new(read_text(private_key)?);
        signing_key_from_pem(&pem)?
    } else {
        let pair = KeyPair::generate()?;
        write_text(private_key, pair.private_pem())?;
        debug!(path = %private_key.display(), "wrote new private key");
        pair.signing_key()?
    };

    let bundle = config.build(&signer, env)?;
    let output = if pem {
        bundle.pem().to_string()
    } else {
        bundle.pem_base64()
    };
    match generated_csr {
        Some(path) => write_text(path, &output)?,
        None => println!("{output}"),
    }
    info!(subject = bundle.subject(), fingerprint = bundle.fingerprint(), "built CSR");
    Ok(())
}

fn hash(invoice: &Path, previous_hash: Option<&str>) -> Result<()> {
    let xml = read_text(invoice)?;
    let hash = match previous_hash {
        Some(previous) => hash_invoice(&xml, previous)?,
        None => hash_as_submitted(&xml)?.0,
    };
    println!("{hash}");
    Ok(())
}

fn sign(invoice: &Path, private_key: &Path, previous_hash: &str) -> Result<()> {
    let xml = read_text(invoice)?;
    let pem = Zeroizing::new(read_text(private_key)?);
    let key = signing_key_from_pem(&pem)?;
    let invoice_hash = hash_invoice(&xml, previous_hash)?;
    let stamp = sign_hash(&key, &invoice_hash)?;
    let out = serde_json::json!({
        "invoiceHash": invoice_hash,
        "signature": stamp.signature,
        "publicKey": stamp.public_key,
        "algorithm": stamp.algorithm,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn verify(invoices: &[PathBuf]) -> Result<()> {
    let documents = invoices
        .iter()
        .map(|path| read_text(path))
        .collect::<Result<Vec<_>>>()?;
    let hashes = match verify_chain(&documents) {
        Ok(hashes) => hashes,
        Err(e) => bail!("chain verification failed: {e}"),
    };
    for (path, hash) in invoices.iter().zip(&hashes) {
        println!("{hash}  {}", path.display());
    }
    println!("OK");
    Ok(())
}

fn qr_decode(payload: &str) -> Result<()> {
    let fields = qr::parse(payload)?;
    println!("{}", serde_json::to_string_pretty(&fields)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen {
            private_key,
            public_key,
            encrypt,
            key_id,
        } => keygen(&private_key, public_key.as_deref(), encrypt, &key_id),
        Commands::Csr {
            csr_config,
            private_key,
            generated_csr,
            env,
            pem,
        } => csr(&csr_config, &private_key, generated_csr.as_deref(), &env, pem),
        Commands::Hash {
            invoice,
            previous_hash,
        } => hash(&invoice, previous_hash.as_deref()),
        Commands::Sign {
            invoice,
            private_key,
            previous_hash,
        } => sign(&invoice, &private_key, &previous_hash),
        Commands::VerifyChain { invoices } => verify(&invoices),
        Commands::QrDecode { payload } => qr_decode(&payload),
    }
}
