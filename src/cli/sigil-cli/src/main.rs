//! Sigil CLI - Certificate authority operator tool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sigil_crypto::{KeyAlgorithm, WrappingKey};
use sigil_pki::chain::{self, TrustAnchorSet, ValidationOptions};
use sigil_pki::crl::crl_pem;
use sigil_pki::csr::{generate_csr, RequestedExtensions};
use sigil_pki::keygen;
use sigil_pki::profile::{ExtKeyUsage, NameConstraintsSpec, NameSubtree, PolicyOptions};
use sigil_pki::x509::{self, parse_certificate, pem_blocks, CERTIFICATE_LABEL};
use sigil_pki::{
    CaConfig, CertificateProfile, CertificateType, ChainValidation, CreateCaRequest,
    IssueRequest, PkiConfig, PkiEngine, RevocationReason, SanList,
};
use sigil_storage_sqlite::SqliteBackend;
use x509_cert::Certificate;

/// Name of the SQLite database under the data directory.
const DATABASE_NAME: &str = "sigil";

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "sigil")]
#[command(about = "Nubster Sigil CLI - Run a certificate authority")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    globals: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Directory holding the Sigil database
    #[arg(long, default_value = "./sigil-data", env = "SIGIL_DATA_DIR")]
    data_dir: PathBuf,

    /// Wrapping key protecting stored private keys (base64, 32 bytes)
    #[arg(long, env = "SIGIL_WRAPPING_KEY", hide_env_values = true)]
    wrapping_key: Option<String>,

    /// Engine configuration file (TOML)
    #[arg(long, env = "SIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Identity recorded in audit events and write history
    #[arg(long, default_value = "cli", env = "SIGIL_ACTOR")]
    actor: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Wrapping key utilities
    WrappingKey {
        #[command(subcommand)]
        command: WrappingKeyCommands,
    },
    /// Certificate authority management
    Ca {
        #[command(subcommand)]
        command: CaCommands,
    },
    /// Certificate issuance and revocation
    Cert {
        #[command(subcommand)]
        command: CertCommands,
    },
    /// Certificate revocation lists
    Crl {
        #[command(subcommand)]
        command: CrlCommands,
    },
    /// Certificate chain validation
    Chain {
        #[command(subcommand)]
        command: ChainCommands,
    },
    /// Generate a key pair and optional CSR without storing anything
    Keygen {
        /// Key algorithm (rsa-2048, rsa-3072, rsa-4096, ecdsa-p256, ecdsa-p384, ed25519)
        #[arg(long, default_value = "ecdsa-p256")]
        key: KeyAlgorithm,
        /// Subject DN; a CSR is produced when given
        #[arg(long)]
        subject: Option<String>,
        /// Subject alternative names requested in the CSR
        #[arg(long = "san")]
        sans: Vec<String>,
        /// Write the private key here instead of stdout
        #[arg(long)]
        out_key: Option<PathBuf>,
    },
    /// Re-wrap every stored private key under a new wrapping key
    RotateWrappingKey {
        /// New wrapping key (base64, 32 bytes)
        #[arg(long, env = "SIGIL_NEW_WRAPPING_KEY", hide_env_values = true)]
        new_key: String,
    },
}

#[derive(Subcommand)]
enum WrappingKeyCommands {
    /// Print a new random wrapping key
    Generate,
}

#[derive(Subcommand)]
enum CaCommands {
    /// Create a CA (key pair and CSR, not yet active)
    Create {
        /// CA identifier ([a-z0-9_-]+)
        id: String,
        /// Subject DN, e.g. "CN=Example Root CA,O=Example,C=FR"
        #[arg(long)]
        subject: String,
        /// Key algorithm
        #[arg(long)]
        key: Option<KeyAlgorithm>,
        /// CRL distribution point for issued certificates
        #[arg(long)]
        crl_url: Option<String>,
        /// OCSP responder for issued certificates
        #[arg(long)]
        ocsp_url: Option<String>,
    },
    /// Make a created CA a self-signed root
    SelfSign {
        /// CA identifier
        id: String,
        /// Validity in days
        #[arg(long, default_value = "3650")]
        days: u32,
        /// pathLenConstraint
        #[arg(long)]
        path_len: Option<u8>,
    },
    /// Activate a created CA with an externally signed certificate
    Activate {
        /// CA identifier
        id: String,
        /// Signed CA certificate (PEM)
        #[arg(long)]
        cert: PathBuf,
        /// Issuer chain (PEM bundle, nearest issuer first)
        #[arg(long)]
        chain: Option<PathBuf>,
    },
    /// Create a CA signed by an active parent CA
    Intermediate {
        /// Parent CA identifier
        parent: String,
        /// New CA identifier
        id: String,
        /// Subject DN
        #[arg(long)]
        subject: String,
        /// Key algorithm
        #[arg(long)]
        key: Option<KeyAlgorithm>,
        /// Validity in days
        #[arg(long, default_value = "1825")]
        days: u32,
        /// pathLenConstraint
        #[arg(long)]
        path_len: Option<u8>,
        /// CRL distribution point for issued certificates
        #[arg(long)]
        crl_url: Option<String>,
        /// OCSP responder for issued certificates
        #[arg(long)]
        ocsp_url: Option<String>,
    },
    /// Stop a CA from signing
    Suspend {
        /// CA identifier
        id: String,
    },
    /// Resume a suspended CA
    Reactivate {
        /// CA identifier
        id: String,
    },
    /// List CAs
    List,
    /// Show a CA
    Show {
        /// CA identifier
        id: String,
        /// Print the CA certificate (or the CSR while initializing)
        #[arg(long)]
        pem: bool,
    },
}

#[derive(Subcommand)]
enum CertCommands {
    /// Issue a certificate
    Issue {
        /// Issuing CA identifier
        ca: String,
        /// Subject DN (defaults to the CSR subject)
        #[arg(long)]
        subject: Option<String>,
        /// Certificate type (server, client, ca)
        #[arg(long = "type", default_value = "server")]
        cert_type: CertificateType,
        /// Subject alternative names
        #[arg(long = "san")]
        sans: Vec<String>,
        /// Extended key usages (server-auth, client-auth, code-signing, email-protection)
        #[arg(long = "eku")]
        ext_key_usage: Vec<ExtKeyUsage>,
        /// pathLenConstraint (CA certificates only)
        #[arg(long)]
        path_len: Option<u8>,
        /// Certificate policy OIDs
        #[arg(long = "policy")]
        policies: Vec<String>,
        /// Permitted name subtree, e.g. dns:example.com or ip:10.0.0.0/8
        #[arg(long = "permit")]
        permitted: Vec<NameSubtree>,
        /// Excluded name subtree
        #[arg(long = "exclude")]
        excluded: Vec<NameSubtree>,
        /// Validity in days
        #[arg(long, default_value = "365")]
        days: u32,
        /// Sign this CSR instead of generating a key pair
        #[arg(long)]
        csr: Option<PathBuf>,
        /// Algorithm of the generated key pair
        #[arg(long)]
        key: Option<KeyAlgorithm>,
        /// Keep the generated private key, encrypted, in the database
        #[arg(long)]
        store_key: bool,
        /// Write the generated private key here instead of stdout
        #[arg(long)]
        out_key: Option<PathBuf>,
    },
    /// Revoke a certificate
    Revoke {
        /// Serial number (hex)
        serial: String,
        /// Reason (key-compromise, ca-compromise, affiliation-changed,
        /// superseded, cessation-of-operation, certificate-hold, remove-from-crl)
        #[arg(long, default_value = "superseded")]
        reason: RevocationReason,
    },
    /// Show a certificate
    Show {
        /// Serial number (hex)
        serial: String,
        /// Print the PEM encoding
        #[arg(long)]
        pem: bool,
    },
    /// List certificates of a CA
    List {
        /// CA identifier
        ca: String,
    },
}

#[derive(Subcommand)]
enum CrlCommands {
    /// Generate and store a CRL
    Generate {
        /// CA identifier
        ca: String,
        /// Generate a delta CRL over the latest full CRL
        #[arg(long)]
        delta: bool,
        /// Write the CRL (PEM) here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validate a CRL against a CA's certificate
    Verify {
        /// CA identifier
        ca: String,
        /// CRL file (PEM or DER)
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ChainCommands {
    /// Validate a certificate chain
    Verify {
        /// Leaf certificate (PEM or DER)
        leaf: PathBuf,
        /// Extra intermediate certificates (PEM bundles)
        #[arg(long = "intermediate")]
        intermediates: Vec<PathBuf>,
        /// Trust these roots instead of the database's active root CAs
        #[arg(long = "trust")]
        trust: Vec<PathBuf>,
        /// Accept chains ending in an untrusted root
        #[arg(long)]
        allow_untrusted_root: bool,
        /// Skip the keyCertSign check on issuers
        #[arg(long)]
        skip_key_usage: bool,
        /// Skip required-extension and algorithm checks
        #[arg(long)]
        skip_extensions: bool,
    },
}

// ============================================================================
// Setup
// ============================================================================

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<PkiConfig> {
    let Some(path) = path else {
        return Ok(PkiConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
}

fn decode_wrapping_key(encoded: &str) -> Result<WrappingKey> {
    let bytes = BASE64
        .decode(encoded.trim())
        .context("Wrapping key is not valid base64")?;
    WrappingKey::from_bytes(&bytes).context("Wrapping key must be 32 bytes")
}

async fn open_engine(globals: &GlobalArgs) -> Result<PkiEngine> {
    let encoded = globals
        .wrapping_key
        .as_deref()
        .context("Wrapping key required. Set SIGIL_WRAPPING_KEY or use --wrapping-key")?;
    let wrapping_key = decode_wrapping_key(encoded)?;
    let config = load_config(globals.config.as_deref())?;

    debug!(data_dir = %globals.data_dir.display(), actor = %globals.actor, "Opening Sigil database");
    let backend = SqliteBackend::open(&globals.data_dir, DATABASE_NAME)
        .await
        .with_context(|| format!("Failed to open database in {}", globals.data_dir.display()))?
        .with_actor(globals.actor.clone());

    PkiEngine::new(Arc::new(backend), &wrapping_key, config).context("Failed to start PKI engine")
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn read_certificates(path: &Path) -> Result<Vec<Certificate>> {
    let bytes = read_file(path)?;
    let text = String::from_utf8_lossy(&bytes);
    if text.contains("-----BEGIN") {
        pem_blocks(&text, CERTIFICATE_LABEL)?
            .iter()
            .map(|der| parse_certificate(der).map_err(Into::into))
            .collect()
    } else {
        Ok(vec![parse_certificate(&bytes)?])
    }
}

fn write_secret(path: Option<&Path>, pem: &str) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, pem)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Private key written to {}", path.display());
        },
        None => print!("{pem}"),
    }
    Ok(())
}

fn print_ca(ca: &CaConfig) {
    println!("CA '{}':", ca.id);
    println!("  Subject:     {}", ca.subject);
    println!("  Status:      {}", ca.status);
    println!("  Algorithm:   {}", ca.key_algorithm);
    if let Some(parent) = &ca.parent_id {
        println!("  Parent:      {parent}");
    }
    if let (Some(not_before), Some(not_after)) = (ca.not_before, ca.not_after) {
        println!("  Valid:       {not_before} .. {not_after}");
    }
    if let Some(url) = &ca.crl_url {
        println!("  CRL URL:     {url}");
    }
    if let Some(url) = &ca.ocsp_url {
        println!("  OCSP URL:    {url}");
    }
    println!("  CRL number:  {}", ca.crl_number);
    println!("  Chain:       {} certificate(s)", ca.chain_pem.len());
}

fn print_chain(result: &ChainValidation) {
    println!("Chain is {}", if result.is_valid { "VALID" } else { "INVALID" });
    for (index, node) in result.nodes.iter().enumerate() {
        println!("  [{index}] {} ({})", node.subject, node.status);
        println!("      serial {}  expires {}", node.serial, node.not_after);
    }
    if !result.issues.is_empty() {
        println!("Issues:");
        for issue in &result.issues {
            println!("  {issue}");
        }
    }
}

// ============================================================================
// Command Handlers
// ============================================================================

fn cmd_wrapping_key_generate() -> Result<()> {
    let key = WrappingKey::generate();
    println!("{}", BASE64.encode(key.as_bytes()));
    eprintln!("Store this key safely: without it no stored private key can be used.");
    Ok(())
}

fn cmd_keygen(
    algorithm: KeyAlgorithm,
    subject: Option<&str>,
    sans: &[String],
    out_key: Option<&Path>,
) -> Result<()> {
    let pair = keygen::generate(algorithm)?;

    if let Some(subject) = subject {
        let sans = SanList::parse(sans).map_err(|violations| {
            anyhow!(
                "Invalid SAN: {}",
                violations
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            )
        })?;
        let csr = generate_csr(
            subject,
            &pair,
            &RequestedExtensions {
                sans,
                ..Default::default()
            },
        )?;
        print!("{}", csr.to_pem()?);
    } else {
        print!("{}", pair.public_key().to_spki_pem()?);
    }

    write_secret(out_key, &pair.private_key_pem()?)
}

async fn cmd_ca(engine: &PkiEngine, actor: &str, command: CaCommands) -> Result<()> {
    match command {
        CaCommands::Create {
            id,
            subject,
            key,
            crl_url,
            ocsp_url,
        } => {
            let request = CreateCaRequest {
                key_algorithm: key,
                crl_url,
                ocsp_url,
                ..CreateCaRequest::new(id, subject)
            };
            let ca = engine.create_ca(request, actor).await?;
            println!("CA '{}' created ({}).", ca.id, ca.key_algorithm);
            println!("Self-sign it with `sigil ca self-sign {}` or have this CSR signed:", ca.id);
            print!("{}", ca.csr_pem.as_deref().unwrap_or_default());
        },
        CaCommands::SelfSign { id, days, path_len } => {
            let ca = engine.self_sign_ca(&id, days, path_len, actor).await?;
            println!("CA '{}' is now an active root.", ca.id);
        },
        CaCommands::Activate { id, cert, chain } => {
            let certificate = String::from_utf8(read_file(&cert)?)
                .context("Certificate file is not PEM")?;
            let chain_pem = match chain {
                Some(path) => read_certificates(&path)?
                    .iter()
                    .map(x509::certificate_pem)
                    .collect::<sigil_pki::Result<Vec<_>>>()?,
                None => Vec::new(),
            };
            let ca = engine.activate_ca(&id, &certificate, &chain_pem, actor).await?;
            println!("CA '{}' activated.", ca.id);
        },
        CaCommands::Intermediate {
            parent,
            id,
            subject,
            key,
            days,
            path_len,
            crl_url,
            ocsp_url,
        } => {
            let request = CreateCaRequest {
                key_algorithm: key,
                crl_url,
                ocsp_url,
                ..CreateCaRequest::new(id, subject)
            };
            let ca = engine
                .create_intermediate_ca(&parent, request, days, path_len, actor)
                .await?;
            println!("Intermediate CA '{}' signed by '{parent}' and active.", ca.id);
        },
        CaCommands::Suspend { id } => {
            engine.suspend_ca(&id, actor).await?;
            println!("CA '{id}' suspended.");
        },
        CaCommands::Reactivate { id } => {
            engine.reactivate_ca(&id, actor).await?;
            println!("CA '{id}' reactivated.");
        },
        CaCommands::List => {
            let cas = engine.list_cas().await?;
            if cas.is_empty() {
                println!("No CAs found");
            }
            for ca in cas {
                println!("{:<24} {:<13} {}", ca.id, ca.status.to_string(), ca.subject);
            }
        },
        CaCommands::Show { id, pem } => {
            let ca = engine.get_ca(&id).await?;
            if pem {
                let pem = ca.certificate_pem.as_deref().or(ca.csr_pem.as_deref());
                print!("{}", pem.unwrap_or_default());
            } else {
                print_ca(&ca);
            }
        },
    }
    Ok(())
}

async fn cmd_cert(engine: &PkiEngine, actor: &str, command: CertCommands) -> Result<()> {
    match command {
        CertCommands::Issue {
            ca,
            subject,
            cert_type,
            sans,
            ext_key_usage,
            path_len,
            policies,
            permitted,
            excluded,
            days,
            csr,
            key,
            store_key,
            out_key,
        } => {
            let name_constraints = (!permitted.is_empty() || !excluded.is_empty())
                .then_some(NameConstraintsSpec { permitted, excluded });
            let policies = PolicyOptions {
                certificate_policies: policies,
                policy_constraints: None,
                name_constraints,
            };
            let profile =
                CertificateProfile::from_parts(cert_type, &sans, ext_key_usage, path_len, policies)?;
            let csr_pem = match csr {
                Some(path) => Some(
                    String::from_utf8(read_file(&path)?).context("CSR file is not PEM")?,
                ),
                None => None,
            };

            let request = IssueRequest {
                ca_id: ca,
                subject_dn: subject,
                profile,
                validity_days: days,
                key_algorithm: key,
                csr_pem,
                store_private_key: store_key,
            };
            let issued = engine.issue(request, actor).await?;

            eprintln!("Serial:      {}", issued.serial);
            eprintln!("Fingerprint: {}", issued.fingerprint);
            print!("{}", issued.certificate_pem);
            if let Some(private_key) = &issued.private_key_pem {
                write_secret(out_key.as_deref(), private_key)?;
            }
        },
        CertCommands::Revoke { serial, reason } => {
            let record = engine.revoke(&serial, reason, actor).await?;
            println!("Certificate {} revoked ({}).", record.serial, record.reason);
        },
        CertCommands::Show { serial, pem } => {
            let record = engine.get_certificate(&serial).await?;
            if pem {
                print!("{}", record.certificate_pem);
            } else {
                println!("Certificate {}:", record.serial);
                println!("  Subject:     {}", record.subject);
                println!("  Issuer:      {}", record.issuer);
                println!("  CA:          {}", record.ca_id);
                println!("  Type:        {}", record.cert_type);
                println!("  Algorithm:   {}", record.key_algorithm);
                println!("  Status:      {}", record.status);
                println!("  Valid:       {} .. {}", record.not_before, record.not_after);
                println!("  Fingerprint: {}", record.fingerprint);
                println!("  Key stored:  {}", record.wrapped_key.is_some());
            }
        },
        CertCommands::List { ca } => {
            let records = engine.list_certificates(&ca).await?;
            if records.is_empty() {
                println!("No certificates found");
            }
            for record in records {
                println!(
                    "{}  {:<8} {:<7} {}",
                    record.serial,
                    record.status.to_string(),
                    record.cert_type.to_string(),
                    record.subject
                );
            }
        },
    }
    Ok(())
}

async fn cmd_crl(engine: &PkiEngine, actor: &str, command: CrlCommands) -> Result<()> {
    match command {
        CrlCommands::Generate { ca, delta, out } => {
            let record = if delta {
                engine.generate_delta_crl(&ca, actor).await?
            } else {
                engine.generate_crl(&ca, actor).await?
            };
            let pem = crl_pem(&record.crl_der)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, pem)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!(
                        "CRL #{} ({} entries) written to {}",
                        record.number,
                        record.entry_count(),
                        path.display()
                    );
                },
                None => print!("{pem}"),
            }
        },
        CrlCommands::Verify { ca, file } => {
            let result = engine.validate_crl(&ca, &read_file(&file)?).await?;
            let kind = if result.is_delta { "Delta CRL" } else { "CRL" };
            println!(
                "{kind} #{} is {} ({} entries)",
                result.crl_number.map_or_else(|| "?".to_string(), |n| n.to_string()),
                if result.is_valid { "VALID" } else { "INVALID" },
                result.entry_count
            );
            for issue in &result.issues {
                println!("  {issue}");
            }
            if !result.is_valid {
                bail!("CRL validation failed");
            }
        },
    }
    Ok(())
}

async fn cmd_chain_verify(globals: &GlobalArgs, command: ChainCommands) -> Result<()> {
    let ChainCommands::Verify {
        leaf,
        intermediates,
        trust,
        allow_untrusted_root,
        skip_key_usage,
        skip_extensions,
    } = command;

    let options = ValidationOptions {
        require_trusted_root: !allow_untrusted_root,
        check_key_usage: !skip_key_usage,
        validate_extensions: !skip_extensions,
        ..ValidationOptions::from_config(&load_config(globals.config.as_deref())?)
    };
    let mut extra = Vec::new();
    for path in &intermediates {
        extra.extend(read_certificates(path)?);
    }
    let leaf = read_file(&leaf)?;

    let result = if trust.is_empty() {
        let engine = open_engine(globals).await?;
        engine.validate_chain(&leaf, &extra, &options).await?
    } else {
        let mut roots = Vec::new();
        for path in &trust {
            roots.extend(read_certificates(path)?);
        }
        let anchors = TrustAnchorSet::new(roots)?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .context("System clock is before 1970")?
            .as_secs();
        chain::validate_chain(&parse_certificate(&leaf)?, &extra, &anchors, &options, now)?
    };

    print_chain(&result);
    if !result.is_valid {
        bail!("Chain validation failed");
    }
    Ok(())
}

async fn cmd_rotate_wrapping_key(engine: &PkiEngine, actor: &str, new_key: &str) -> Result<()> {
    let new_key = decode_wrapping_key(new_key)?;
    let report = engine.rotate_wrapping_key(&new_key, actor).await?;
    println!("Wrapping key rotated to {}.", report.key_id);
    println!("  CA keys re-wrapped:          {}", report.cas_rewrapped);
    println!("  Certificate keys re-wrapped: {}", report.certificates_rewrapped);
    println!("Use the new key from now on; the old one is no longer needed.");
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { globals, command } = Cli::parse();
    init_tracing(&globals.log_level);

    match command {
        Commands::WrappingKey {
            command: WrappingKeyCommands::Generate,
        } => cmd_wrapping_key_generate(),
        Commands::Keygen {
            key,
            subject,
            sans,
            out_key,
        } => cmd_keygen(key, subject.as_deref(), &sans, out_key.as_deref()),
        Commands::Chain { command } => cmd_chain_verify(&globals, command).await,
        Commands::Ca { command } => {
            let engine = open_engine(&globals).await?;
            cmd_ca(&engine, &globals.actor, command).await
        },
        Commands::Cert { command } => {
            let engine = open_engine(&globals).await?;
            cmd_cert(&engine, &globals.actor, command).await
        },
        Commands::Crl { command } => {
            let engine = open_engine(&globals).await?;
            cmd_crl(&engine, &globals.actor, command).await
        },
        Commands::RotateWrappingKey { new_key } => {
            let engine = open_engine(&globals).await?;
            cmd_rotate_wrapping_key(&engine, &globals.actor, &new_key).await
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_partial_config_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sigil.toml");
        std::fs::write(&path, "crl_validity_hours = 12\nmax_chain_length = 5\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.crl_validity_hours, 12);
        assert_eq!(config.max_chain_length, 5);
        assert_eq!(config.max_validity_days, PkiConfig::default().max_validity_days);
    }

    #[test]
    fn test_missing_config_is_default() {
        assert_eq!(load_config(None).unwrap(), PkiConfig::default());
    }

    #[test]
    fn test_wrapping_key_roundtrip() {
        let key = WrappingKey::generate();
        let decoded = decode_wrapping_key(&BASE64.encode(key.as_bytes())).unwrap();
        assert_eq!(decoded.as_bytes(), key.as_bytes());

        assert!(decode_wrapping_key("not base64!").is_err());
        assert!(decode_wrapping_key(&BASE64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn test_issue_arguments_parse() {
        let cli = Cli::try_parse_from([
            "sigil",
            "cert",
            "issue",
            "root",
            "--subject",
            "CN=example.com",
            "--san",
            "example.com",
            "--san",
            "203.0.113.5",
            "--key",
            "rsa-2048",
        ])
        .unwrap();

        match cli.command {
            Commands::Cert {
                command: CertCommands::Issue { sans, key, cert_type, .. },
            } => {
                assert_eq!(sans, vec!["example.com", "203.0.113.5"]);
                assert_eq!(key, Some(KeyAlgorithm::Rsa { bits: 2048 }));
                assert_eq!(cert_type, CertificateType::Server);
            },
            _ => panic!("expected cert issue"),
        }
    }
}
