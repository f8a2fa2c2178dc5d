use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{async_utils::block_on_and_abandon_blocking_tasks, prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod document;
mod ocr;
mod page_iter;
mod prelude;
mod text;
mod ui;

/// Read the text in an image, and print it as a single line.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - OCR_ENGINE: The OCR engine to use (onnx or tesseract).
  - OCR_DEVICE: Where to run the models (auto, cpu or cuda).
  - OCR_MODEL_DIR: Directory containing det.onnx, rec.onnx, vocab.txt
    and an optional ocr.toml.
  - OCR_TESSERACT_LANG: Language for the tesseract engine.
  - RUST_LOG: Log filter. Logs always go to standard error.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR one image and print its text. Prints an empty line on failure.
    Recognize(cmd::recognize::RecognizeOpts),
    /// OCR a frame showing a title, and print the title if it's new.
    Title(cmd::title::TitleOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Recognize(opts) => opts.output_path.is_none(),
            Cmd::Title(_) => true,
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    // Don't let inference abandoned by `--timeout-secs` keep us alive.
    block_on_and_abandon_blocking_tasks(real_main(ui))?
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Another process is usually reading our stdout, so keep the terminal
    // quiet unless we're writing to a file.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Recognize(opts) => cmd::recognize::cmd_recognize(ui, opts).await?,
        Cmd::Title(opts) => cmd::title::cmd_title(ui, opts).await?,
    }
    Ok(())
}
