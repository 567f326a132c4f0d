use std::{io::Read, path::PathBuf, str::FromStr};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, MediaType};

use winlayers::{
    applier::{new_filesystem_applier, ApplyOptions, FsApplier},
    config::Config,
    content::{ContentProvider, OciLayoutStore},
    mount::Mount,
};

/// Applies a container layer from an OCI image layout to a directory.
#[derive(Debug, Parser)]
#[clap(name = "winlayer-apply", version)]
pub struct App {
    /// The OCI image layout directory holding the blob
    #[clap(long)]
    layout: PathBuf,
    /// Digest of the layer blob (sha256:...)
    #[clap(long)]
    digest: String,
    /// Size of the layer blob in bytes
    #[clap(long)]
    size: u64,
    #[clap(long, default_value = "application/vnd.oci.image.layer.v1.tar")]
    media_type: String,
    /// The directory to apply the layer to
    #[clap(long)]
    target: PathBuf,
    /// Configuration file
    #[clap(long)]
    config: Option<PathBuf>,
    /// Apply the layer as is, instead of as a Windows layer
    #[clap(long)]
    plain: bool,
}

/// Reports bytes read from blobs on a progress bar.
#[derive(Clone)]
struct ProgressStore {
    store: OciLayoutStore,
    bar: ProgressBar,
}

impl ContentProvider for ProgressStore {
    fn reader(&self, desc: &Descriptor) -> std::io::Result<Box<dyn Read + Send>> {
        self.bar.set_length(desc.size());
        self.bar.reset();
        let reader = self.store.reader(desc)?;
        Ok(Box::new(self.bar.wrap_read(reader)))
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let desc = DescriptorBuilder::default()
        .media_type(MediaType::from(args.media_type.as_str()))
        .digest(Digest::from_str(&args.digest).context("parsing --digest")?)
        .size(args.size)
        .build()?;

    let bar = ProgressBar::new(args.size);
    bar.set_style(
        ProgressStyle::with_template(
            "[eta {eta}] {bar:40.cyan/blue} {decimal_bytes:>7}/{decimal_total_bytes:7} {msg}",
        )?
        .progress_chars("##-"),
    );
    bar.set_message(args.digest.clone());
    let store = ProgressStore {
        store: OciLayoutStore::new(&args.layout),
        bar: bar.clone(),
    };

    let applier = new_filesystem_applier(store.clone(), FsApplier::new(store), &config);
    let opts = ApplyOptions {
        windows_layer_mode: !args.plain,
    };
    let applied = applier
        .apply(&desc, &[Mount::bind(&args.target)], &opts)
        .with_context(|| format!("applying {} to {:?}", args.digest, args.target))?;
    bar.finish_and_clear();

    println!("{}", serde_json::to_string_pretty(&applied)?);
    Ok(())
}
