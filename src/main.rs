use anyhow::{Result, anyhow};
use clap::Parser;
use std::path::Path;

#[derive(Parser, Debug)]
#[command(
    name = "pdf-translator-rust",
    version,
    about = "Translate PDF documents by repainting their text regions"
)]
struct Cli {
    /// PDF file to translate
    #[arg(short = 'd', long = "data")]
    data: Option<String>,

    /// Target language (default: zh)
    #[arg(short = 'l', long = "lang", default_value = "zh")]
    lang: String,

    /// Source language
    #[arg(short = 'L', long = "source-lang", default_value = "en")]
    source_lang: String,

    /// Translation model (defaults to [translator] model)
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// Write translations as PDF text over the cleaned page instead of painting them
    #[arg(long = "overlay")]
    overlay: bool,

    /// Join OCR lines with spaces instead of detecting paragraphs
    #[arg(long = "simple-compose")]
    simple_compose: bool,

    /// Copy pages through without translating their images
    #[arg(long = "no-images")]
    no_images: bool,

    /// Write layout overlays and region dumps next to the output
    #[arg(long = "debug")]
    debug: bool,

    /// Run the HTTP server on this address (e.g. 127.0.0.1:8000)
    #[arg(long = "serve")]
    serve: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    pdf_translator_rust::logging::init(cli.verbose, cli.serve.is_some())?;

    if let Some(addr) = cli.serve {
        let settings_path = cli.read_settings.as_deref().map(Path::new);
        let settings = pdf_translator_rust::settings::load_settings(settings_path)?;
        return pdf_translator_rust::server::run_server(settings, addr).await;
    }

    let data = cli
        .data
        .ok_or_else(|| anyhow!("--data <pdf> is required unless --serve is given"))?;
    let output = pdf_translator_rust::run(pdf_translator_rust::Config {
        data,
        lang: cli.lang,
        source_lang: cli.source_lang,
        model: cli.model,
        overlay: cli.overlay,
        simple_compose: cli.simple_compose,
        no_images: cli.no_images,
        debug: cli.debug,
        settings_path: cli.read_settings,
    })
    .await?;
    println!("{}", output);
    Ok(())
}
