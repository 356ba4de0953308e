use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use vodopt_core::{
    load_vodopt_config, JobProgressStore, JobRecord, JobReport, Optimizer, OptimizerEvent,
    RebuiltPlaylist, SelectionSummary, SkippedInput, VodoptConfig,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vodopt_core::ConfigError),
    #[error("optimizer error: {0}")]
    Optimizer(#[from] vodopt_core::OptimizerError),
    #[error("playlist error: {0}")]
    Playlist(#[from] vodopt_core::PlaylistError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "vodopt command-line control interface", long_about = None)]
pub struct Cli {
    /// Caminho do vodopt.toml principal
    #[arg(long, default_value = "configs/vodopt.toml")]
    pub config: PathBuf,
    /// Diretório override para artefatos HLS (substitui paths.output_dir)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Caminho alternativo para o documento de progresso
    #[arg(long)]
    pub state_file: Option<PathBuf>,
    /// Binário ffmpeg alternativo
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,
    /// Binário ffprobe alternativo
    #[arg(long)]
    pub ffprobe: Option<PathBuf>,
    /// Logging detalhado (RUST_LOG tem precedência)
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
    /// Formato de saída
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Valida e registra um lote de vídeos para conversão
    Select(SelectArgs),
    /// Converte os vídeos pendentes (registrando antes, se arquivos forem passados)
    Convert(ConvertArgs),
    /// Reinicia do zero os jobs incompletos do documento de progresso
    Resume,
    /// Reconstrói um manifesto VOD a partir dos segmentos em disco
    Rebuild(RebuildArgs),
    /// Exibe o estado do lote registrado
    Status,
    /// Gera completions de shell
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct SelectArgs {
    /// Arquivos de vídeo candidatos
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Arquivos de vídeo (vazio converte o lote já registrado)
    pub files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RebuildArgs {
    /// Diretório contendo os segmentos .ts
    #[arg(long)]
    pub output_dir: PathBuf,
    /// Caminho do manifesto .m3u8 a reescrever
    #[arg(long)]
    pub manifest: PathBuf,
    /// Prefixo dos arquivos de segmento (ex.: clip_segment_)
    #[arg(long)]
    pub segment_prefix: String,
    /// Duração alvo de cada segmento em segundos
    #[arg(long, default_value_t = 10.0)]
    pub target_duration: f64,
    /// Duração total do vídeo em segundos
    #[arg(long)]
    pub total_duration: f64,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell alvo
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn init_logging(verbose: bool) {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if verbose {
            "vodopt_core=trace,vodoptctl=debug".to_string()
        } else {
            "vodopt_core=info".to_string()
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        print_completions(args.shell);
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Select(args) => {
            let summary = context.select(&args.files).await?;
            render(&summary, cli.format)?;
        }
        Commands::Convert(args) => {
            let report = context.run_batch(&args.files, false).await?;
            render(&report, cli.format)?;
        }
        Commands::Resume => {
            let report = context.run_batch(&[], true).await?;
            render(&report, cli.format)?;
        }
        Commands::Rebuild(args) => {
            let report = context.rebuild(args)?;
            render(&report, cli.format)?;
        }
        Commands::Status => {
            let status = context.status();
            render(&status, cli.format)?;
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn print_completions(shell: Shell) {
    let mut command = Cli::command();
    let name = command.get_name().to_string();
    clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: VodoptConfig,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_vodopt_config(&cli.config)?;
        if let Some(output_dir) = &cli.output_dir {
            config.paths.output_dir = output_dir.display().to_string();
        }
        if let Some(state_file) = &cli.state_file {
            if let Some(parent) = state_file.parent() {
                config.paths.state_dir = parent.display().to_string();
            }
            if let Some(name) = state_file.file_name() {
                config.store.file_name = name.to_string_lossy().into_owned();
            }
        }
        if let Some(ffmpeg) = &cli.ffmpeg {
            config.encoder.ffmpeg = ffmpeg.display().to_string();
        }
        if let Some(ffprobe) = &cli.ffprobe {
            config.encoder.ffprobe = ffprobe.display().to_string();
        }
        Ok(Self { config })
    }

    async fn select(&self, files: &[PathBuf]) -> Result<SelectionSummary> {
        let (mut optimizer, _events) = Optimizer::new(self.config.clone(), None)?;
        Ok(optimizer.select_inputs(files).await?)
    }

    /// Convert and resume share the same shape: optional selection, a
    /// ctrl-c watcher wired to the cancel signal, and an event printer
    /// that keeps progress chatter on stderr so stdout stays renderable.
    async fn run_batch(&self, files: &[PathBuf], restart: bool) -> Result<BatchReport> {
        let (mut optimizer, events) = Optimizer::new(self.config.clone(), None)?;
        let selection = if files.is_empty() {
            None
        } else {
            Some(optimizer.select_inputs(files).await?)
        };

        let cancel = optimizer.cancel_signal();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
        let printer = tokio::spawn(print_events(events));

        let outcome = if restart {
            optimizer.resume().await
        } else {
            optimizer.convert_all().await
        };

        interrupt.abort();
        drop(optimizer);
        let _ = printer.await;

        let jobs = outcome?;
        Ok(BatchReport::new(jobs, selection))
    }

    fn rebuild(&self, args: &RebuildArgs) -> Result<RebuildReport> {
        let rebuilt = vodopt_core::playlist::rebuild(
            &args.output_dir,
            &args.manifest,
            &args.segment_prefix,
            args.target_duration,
            args.total_duration,
        )?;
        Ok(RebuildReport::from(rebuilt))
    }

    fn status(&self) -> StatusReport {
        let store = JobProgressStore::load(self.config.state_file());
        StatusReport::from_store(&store)
    }
}

async fn print_events(mut events: mpsc::Receiver<OptimizerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            OptimizerEvent::Progress { message } => eprintln!("{message}"),
            OptimizerEvent::Completed { message, .. } => eprintln!("{message}"),
            OptimizerEvent::Error { message, .. } => eprintln!("{message}"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub jobs: Vec<JobReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedInput>,
}

impl BatchReport {
    fn new(jobs: Vec<JobReport>, selection: Option<SelectionSummary>) -> Self {
        let skipped = selection.map(|summary| summary.skipped).unwrap_or_default();
        Self { jobs, skipped }
    }
}

impl DisplayFallback for BatchReport {
    fn display(&self) -> String {
        if self.jobs.is_empty() && self.skipped.is_empty() {
            return "Nenhuma conversão pendente".to_string();
        }
        let mut lines = Vec::new();
        for job in &self.jobs {
            lines.push(format!(
                "{input} -> {manifest} ({segments} segmentos)",
                input = job.input.display(),
                manifest = job.manifest_path.display(),
                segments = job.segment_count
            ));
        }
        for skipped in &self.skipped {
            lines.push(format!(
                "ignorado: {path} ({reason})",
                path = skipped.path.display(),
                reason = skipped.reason
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for SelectionSummary {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{count} arquivo(s) aceitos, duração total {total:.2}s",
            count = self.accepted.len(),
            total = self.total_duration
        )];
        for path in &self.accepted {
            lines.push(format!("  - {}", path.display()));
        }
        for skipped in &self.skipped {
            lines.push(format!(
                "  ignorado: {path} ({reason})",
                path = skipped.path.display(),
                reason = skipped.reason
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct RebuildReport {
    pub manifest: PathBuf,
    pub segments: usize,
    pub media_sequence: u64,
}

impl From<RebuiltPlaylist> for RebuildReport {
    fn from(rebuilt: RebuiltPlaylist) -> Self {
        Self {
            manifest: rebuilt.manifest_path,
            segments: rebuilt.segment_count,
            media_sequence: rebuilt.media_sequence,
        }
    }
}

impl DisplayFallback for RebuildReport {
    fn display(&self) -> String {
        format!(
            "Manifesto {manifest} reescrito com {segments} segmento(s), sequência inicial {seq}",
            manifest = self.manifest.display(),
            segments = self.segments,
            seq = self.media_sequence
        )
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state_file: PathBuf,
    pub generated_at: DateTime<Utc>,
    pub combined_percent: f64,
    pub jobs: Vec<JobRecord>,
}

impl StatusReport {
    fn from_store(store: &JobProgressStore) -> Self {
        Self {
            state_file: store.path().to_path_buf(),
            generated_at: Utc::now(),
            combined_percent: store.combined_percent(),
            jobs: store.jobs().to_vec(),
        }
    }
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        if self.jobs.is_empty() {
            return format!("Nenhum lote registrado em {}", self.state_file.display());
        }
        let mut lines = vec![format!(
            "Lote em {state} ({percent:.0}% combinado)",
            state = self.state_file.display(),
            percent = self.combined_percent
        )];
        for job in &self.jobs {
            let flag = if job.completed { "concluído" } else { "pendente" };
            lines.push(format!(
                "  {name}: {progress:.1}% @ {mark:.1}s [{flag}]",
                name = job.file_name,
                progress = job.progress,
                mark = job.time_mark_second,
            ));
        }
        lines.join("\n")
    }
}
