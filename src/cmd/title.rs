//! The `title` subcommand.

use clap::Args;

use crate::{
    async_utils::{read_non_blank_lines, write_text_output},
    ocr::OcrOpts,
    prelude::*,
    text::process_image,
    ui::Ui,
};

/// Options for the `title` subcommand.
#[derive(Debug, Args)]
pub struct TitleOpts {
    /// An image of a frame showing a title.
    pub image_path: PathBuf,

    /// A title we've already seen. May be repeated.
    #[clap(long = "known", value_name = "TITLE")]
    pub known: Vec<String>,

    /// A file of titles we've already seen, one per line.
    #[clap(long, value_name = "FILE")]
    pub known_titles: Option<PathBuf>,

    /// Delete the image once it has been read.
    #[clap(long)]
    pub remove_image: bool,

    #[clap(flatten)]
    pub ocr_opts: OcrOpts,
}

/// The `title` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_title(ui: Ui, opts: &TitleOpts) -> Result<()> {
    let mut known = opts.known.clone();
    if let Some(path) = &opts.known_titles {
        known.extend(read_non_blank_lines(path).await?);
    }
    debug!(count = known.len(), "Loaded known titles");

    if let Some(title) = process_image(
        &ui,
        &opts.image_path,
        &known,
        opts.remove_image,
        &opts.ocr_opts,
    )
    .await
    {
        write_text_output(None, &title).await?;
    }
    Ok(())
}
