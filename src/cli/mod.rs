//! CLI commands for the back-office client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use crate::api::{
    ApiClient, AuthApi, DocumentsApi, PasswordsApi, ProcessingHistoryApi, ProcessingSettingsApi,
};
use crate::batch::BatchOrchestrator;
use crate::bipro::TransferClient;
use crate::cache::DocumentCache;
use crate::config::AtlasConfig;
use crate::ingest::{DropUploader, ShipmentImporter};
use crate::llm::LlmClient;
use crate::models::BOX_TYPES;
use crate::pdf::PdfService;

/// Checked before the tracing subscriber is initialized.
pub fn is_verbose() -> bool {
    std::env::args().any(|a| a == "-v" || a == "--verbose")
}

#[derive(Parser)]
#[command(name = "atlas", about = "ACENCIA back-office document client", version)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and store the session token
    Login {
        username: String,
        /// Read the password from this environment variable instead
        /// of prompting
        #[arg(long, env = "ATLAS_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Log out and wipe the stored token
    Logout,
    /// Classify every document in the inbox
    Process {
        #[arg(long, default_value_t = 0)]
        workers: usize,
        /// Process a single document instead of the whole inbox
        #[arg(long)]
        document: Option<i64>,
    },
    /// Upload files; ZIP/MSG containers are expanded recursively
    Upload { paths: Vec<PathBuf> },
    /// Show box statistics
    Stats,
    /// BiPRO transfer operations
    Bipro {
        #[command(subcommand)]
        command: BiproCommand,
    },
}

#[derive(Subcommand)]
enum BiproCommand {
    /// Test the connection to the configured carrier
    Test,
    /// List pending shipments without confirming them
    List,
    /// Fetch all pending shipments into the inbox
    Fetch,
    /// Acknowledge a single shipment
    Ack { shipment_id: String },
}

struct AppContext {
    config: AtlasConfig,
    client: ApiClient,
    auth: AuthApi,
    docs: DocumentsApi,
}

async fn build_context(require_login: bool) -> anyhow::Result<AppContext> {
    let config = AtlasConfig::load();
    let client = ApiClient::new(config.api_config());
    let auth = AuthApi::new(client.clone());

    auth.install_refresh_handler(Arc::new(|reason: &str| {
        eprintln!("Sitzung abgelaufen: {}", reason);
    }));

    if require_login {
        let state = auth.try_auto_login().await;
        if !state.is_authenticated {
            bail!("Nicht angemeldet. Bitte zuerst: atlas login <benutzer>");
        }
    }

    let docs = DocumentsApi::new(client.clone());
    Ok(AppContext { config, client, auth, docs })
}

fn read_password(prompt: &str) -> anyhow::Result<String> {
    eprint!("{}", prompt);
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Passwort nicht lesbar")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing::debug!(verbose = cli.verbose, "CLI gestartet");

    match cli.command {
        Command::Login { username, password } => {
            let ctx = build_context(false).await?;
            let password = match password {
                Some(p) => p,
                None => read_password("Passwort: ")?,
            };
            let state = ctx.auth.login(&username, &password, true).await?;
            if state.is_authenticated {
                let user = state.user.expect("authenticated state carries a user");
                println!("Angemeldet als {} ({})", user.username, user.account_type);
            } else {
                bail!("Login fehlgeschlagen");
            }
        }

        Command::Logout => {
            let ctx = build_context(false).await?;
            ctx.auth.logout().await;
            println!("Abgemeldet.");
        }

        Command::Process { workers, document } => {
            let ctx = build_context(true).await?;
            let history = ProcessingHistoryApi::new(ctx.client.clone());
            let settings = ProcessingSettingsApi::new(ctx.client.clone());
            let passwords = PasswordsApi::new(ctx.client.clone());
            let llm = LlmClient::new(ctx.config.llm_config());
            let pdf = PdfService::new(Some(passwords));

            let refresh = Arc::new(DocumentCache::new(
                ctx.docs.clone(),
                ctx.config.refresh_interval(),
            ));

            let orchestrator = BatchOrchestrator::new(
                ctx.docs.clone(),
                history,
                settings,
                llm,
                pdf,
                ctx.config.processing.raw_xml_patterns.clone(),
            )
            .with_auto_refresh(refresh);

            if let Some(doc_id) = document {
                let result = orchestrator.process_single_document(doc_id).await?;
                if result.success {
                    println!(
                        "Dokument {} -> {} ({})",
                        result.document_id,
                        result.target_box,
                        result.new_filename.unwrap_or(result.original_filename)
                    );
                } else {
                    bail!(
                        "Dokument {} fehlgeschlagen: {}",
                        doc_id,
                        result.error.unwrap_or_else(|| "nicht zugeordnet".into())
                    );
                }
                return Ok(());
            }

            let worker_count = if workers == 0 {
                ctx.config.processing.max_workers
            } else {
                workers
            };
            let progress: crate::batch::ProgressCallback =
                Arc::new(|current, total, message| {
                    println!("[{}/{}] {}", current, total, message);
                });

            let batch = orchestrator
                .process_inbox(Some(progress), worker_count)
                .await?;

            println!(
                "Fertig: {}/{} erfolgreich in {:.1}s",
                batch.successful_documents, batch.total_documents, batch.duration_seconds
            );
            println!("{}", batch.cost_summary());
        }

        Command::Upload { paths } => {
            if paths.is_empty() {
                bail!("Keine Pfade angegeben");
            }
            let ctx = build_context(true).await?;
            let passwords = PasswordsApi::new(ctx.client.clone());
            let pdf = PdfService::new(Some(passwords.clone()));
            let uploader = DropUploader::new(ctx.docs.clone(), passwords, pdf);

            let summary = uploader.upload_paths(&paths).await?;
            println!(
                "Hochgeladen: {} Dokument(e), {} Roh-Datei(en), {} Fehler",
                summary.documents, summary.raw_files, summary.failed
            );
        }

        Command::Stats => {
            let ctx = build_context(true).await?;
            let stats = ctx.docs.stats().await?;
            for box_type in BOX_TYPES {
                println!("{:>14}: {}", box_type.as_str(), stats.count(box_type));
            }
            println!("{:>14}: {}", "total", stats.total);
        }

        Command::Bipro { command } => {
            let ctx = build_context(true).await?;
            let credentials = ctx.config.bipro.credentials();
            if credentials.endpoint_url.is_empty() {
                bail!("Kein BiPRO-Endpoint konfiguriert ([bipro] in der Konfiguration)");
            }
            let vu_name = credentials.vu_name.clone();
            let transfer = TransferClient::new(credentials)?;

            match command {
                BiproCommand::Test => {
                    let ok = transfer.test_connection().await;
                    transfer.shutdown().await;
                    if ok {
                        println!("Verbindung OK ({})", transfer.profile_key());
                    } else {
                        bail!("Verbindungstest fehlgeschlagen");
                    }
                }
                BiproCommand::List => {
                    let shipments = transfer.list_shipments(false).await;
                    transfer.shutdown().await;
                    let shipments = shipments?;
                    if shipments.is_empty() {
                        println!("Keine Lieferungen bereitstehend.");
                    }
                    for shipment in shipments {
                        println!(
                            "{}  {}  {}",
                            shipment.shipment_id,
                            shipment.created_at.as_deref().unwrap_or("-"),
                            shipment.category.as_deref().unwrap_or("-")
                        );
                    }
                }
                BiproCommand::Fetch => {
                    let importer = ShipmentImporter::new(transfer, ctx.docs.clone(), vu_name);
                    let summary = importer.import_pending().await;
                    importer.shutdown().await;
                    let summary = summary?;
                    println!(
                        "{} Lieferung(en): {} Dokument(e), {} Roh-Datei(en), {} Fehler",
                        summary.shipments, summary.documents, summary.raw_files, summary.failed
                    );
                }
                BiproCommand::Ack { shipment_id } => {
                    let ack = transfer.acknowledge_shipment(&shipment_id).await;
                    transfer.shutdown().await;
                    if ack? {
                        println!("Lieferung {} quittiert.", shipment_id);
                    } else {
                        bail!("Quittierung abgelehnt");
                    }
                }
            }
        }
    }

    Ok(())
}
