use anyhow::Result;
use clap::Parser;
use indicatif::MultiProgress;
use outlook_mail_reader::cli::{self, Cli, Commands, ProgressReporter};
use std::io::Write;
use std::process;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress so log lines don't tear spinners
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log buffer poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log buffer poisoned"))?;
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        eprintln!("\nFor help, run: outlook-mail --help");
        process::exit(1);
    }
}

fn init_tracing(cli: &Cli, multi: Arc<MultiProgress>) {
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("outlook_mail_reader=debug,info"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("outlook_mail_reader=info,warn"))
    };

    let make_writer = MultiProgressMakeWriter { multi };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let multi_progress = Arc::new(MultiProgress::new());
    init_tracing(&cli, Arc::clone(&multi_progress));
    let reporter = ProgressReporter::with_multi_progress((*multi_progress).clone());

    tracing::debug!("outlook-mail starting");

    match &cli.command {
        Commands::Auth { force } => cli::run_auth(&cli, *force, &reporter).await?,
        Commands::Search {
            sender,
            keyword,
            max,
            case_sensitive,
            regex,
            subject_only,
            body_only,
            json,
        } => {
            cli::run_search(
                &cli,
                &reporter,
                sender.clone(),
                keyword.clone(),
                *max,
                *case_sensitive,
                *regex,
                *subject_only,
                *body_only,
                *json,
            )
            .await?
        }
        Commands::Messages { max, filter, json } => {
            cli::run_messages(&cli, &reporter, *max, filter.clone(), *json).await?
        }
        Commands::TestConnection => cli::run_test_connection(&cli, &reporter).await?,
        Commands::Permissions => cli::run_permissions(&cli, &reporter).await?,
        Commands::InitConfig { output, force } => cli::run_init_config(output, *force).await?,
    }

    Ok(())
}
