//! Linha de comando do treinador EM: `train` roda seeding, iterações e
//! decodificação; `evaluate` mede a acurácia da saída contra uma referência.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hmm_em_core::{EmConfig, EmController, LocalRunner, LocalStorage, TaggingParser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hmm-em")]
#[command(about = "Treinamento Baum-Welch distribuído para HMMs discretos", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Treina o modelo e decodifica o corpus
    Train(TrainArgs),

    /// Acurácia many-to-one de uma saída decodificada
    Evaluate {
        /// Arquivo ou diretório com a saída `(obs,estado)`
        #[arg(long)]
        predicted: PathBuf,

        /// Arquivo ou diretório com a referência `(obs,rótulo)`
        #[arg(long)]
        gold: PathBuf,
    },
}

/// Flags sobrescrevem os valores do arquivo de configuração.
#[derive(Args)]
struct TrainArgs {
    /// Arquivo JSON de configuração
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    job_name: Option<String>,

    /// Diretório raiz do armazenamento
    #[arg(long)]
    storage_root: Option<String>,

    /// Arquivo ou diretório do corpus
    #[arg(long)]
    corpus: Option<String>,

    #[arg(long)]
    output: Option<String>,

    /// Topologia de transições (`from to` por linha)
    #[arg(long)]
    transitions: Option<String>,

    /// Topologia de emissões (`state token` por linha)
    #[arg(long)]
    emissions: Option<String>,

    #[arg(long)]
    epsilon: Option<f64>,

    /// Negativo = sem limite
    #[arg(long, allow_hyphen_values = true)]
    max_iterations: Option<i64>,

    #[arg(long)]
    seed: Option<u64>,

    /// 0 = número de CPUs
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    lines_per_partition: Option<usize>,

    #[arg(long)]
    max_attempts: Option<u32>,

    /// Espera antes da primeira reexecução, em ms
    #[arg(long)]
    retry_delay_ms: Option<u64>,
}

impl TrainArgs {
    fn into_config(self) -> Result<EmConfig> {
        let mut config = match &self.config {
            Some(path) => EmConfig::from_json_file(path)
                .with_context(|| format!("lendo configuração {}", path.display()))?,
            None => EmConfig::default(),
        };

        if let Some(value) = self.job_name {
            config.job_name = value;
        }
        if let Some(value) = self.storage_root {
            config.storage_root = value;
        }
        if let Some(value) = self.corpus {
            config.corpus = value;
        }
        if let Some(value) = self.output {
            config.output = value;
        }
        if let Some(value) = self.transitions {
            config.transitions = value;
        }
        if let Some(value) = self.emissions {
            config.emissions = value;
        }
        if let Some(value) = self.epsilon {
            config.epsilon = value;
        }
        if let Some(value) = self.max_iterations {
            config.max_iterations = value;
        }
        if let Some(value) = self.seed {
            config.seed = value;
        }
        if let Some(value) = self.workers {
            config.workers = value;
        }
        if let Some(value) = self.lines_per_partition {
            config.lines_per_partition = value;
        }
        if let Some(value) = self.max_attempts {
            config.max_attempts = value;
        }
        if let Some(value) = self.retry_delay_ms {
            config.retry_delay_ms = value;
        }

        config.validate()?;
        Ok(config)
    }
}

async fn train(args: TrainArgs) -> Result<()> {
    let config = args.into_config()?;
    info!(
        job = %config.job_name,
        raiz = %config.storage_root,
        corpus = %config.corpus,
        saida = %config.output,
        "iniciando treinamento"
    );

    let storage = LocalStorage::new(&config.storage_root);
    let runner = LocalRunner::new(config.workers, config.max_attempts)?
        .with_retry_delay(config.retry_delay());
    info!(workers = runner.workers(), "pool de workers criado");
    let mut controller = EmController::new(storage, runner, config)?;

    let cancel = controller.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C recebido: a rodada atual termina e o corpus é decodificado");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let report = tokio::task::spawn_blocking(move || controller.run())
        .await
        .context("thread de treinamento")??;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn evaluate(predicted: PathBuf, gold: PathBuf) -> Result<()> {
    let storage = LocalStorage::new(".");
    let parser = TaggingParser::new()?;

    let predicted_tags = parser.parse_location(&storage, &predicted.to_string_lossy())?;
    let gold_tags = parser.parse_location(&storage, &gold.to_string_lossy())?;
    let report = hmm_em_core::evaluate(&predicted_tags, &gold_tags)?;

    info!(
        total = report.total,
        corretos = report.correct,
        "avaliação concluída"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => train(args).await,
        Commands::Evaluate { predicted, gold } => evaluate(predicted, gold),
    }
}
