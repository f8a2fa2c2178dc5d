//! The `recognize` subcommand.

use clap::Args;

use crate::{
    async_utils::write_text_output,
    ocr::{OcrOpts, recognize_text, try_recognize_text},
    prelude::*,
    ui::Ui,
};

/// Options for the `recognize` subcommand.
#[derive(Debug, Args)]
pub struct RecognizeOpts {
    /// The image to OCR.
    pub image_path: PathBuf,

    #[clap(flatten)]
    pub ocr_opts: OcrOpts,

    /// Exit with an error if OCR fails, instead of printing an empty line.
    #[clap(long)]
    pub fail_on_error: bool,

    /// Output location. Defaults to standard output.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,
}

/// The `recognize` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_recognize(ui: Ui, opts: &RecognizeOpts) -> Result<()> {
    let text = if opts.fail_on_error {
        try_recognize_text(&ui, &opts.image_path, &opts.ocr_opts).await?
    } else {
        recognize_text(&ui, &opts.image_path, &opts.ocr_opts).await
    };
    write_text_output(opts.output_path.as_deref(), &text).await
}
