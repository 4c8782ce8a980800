use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use indicatif::MultiProgress;

use unlayer::oci::{self, ImageLayout, Progress, Unpacker};

/// unlayer
#[derive(Debug, Parser)]
#[clap(name = "unlayer", version)]
struct App {
    /// Manifest to use when the image index lists more than one
    #[clap(long)]
    reference: Option<String>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Flattens an image into a directory (wiping the directory first)
    Unpack {
        /// an OCI image-layout directory
        image: PathBuf,
        /// where the flattened tree goes
        output: PathBuf,
        /// don't restore file ownership, even when running as root
        #[clap(long)]
        no_chown: bool,
    },
    /// Lists the layers of an image, base to top
    Layers {
        /// an OCI image-layout directory
        image: PathBuf,
    },
    /// Lists the entries of a single layer
    LsLayer {
        /// an OCI image-layout directory
        image: PathBuf,
        /// position of the layer in the manifest, base = 0
        layer: usize,
    },
}

struct ConsoleProgress {
    multi: MultiProgress,
}

impl Progress for ConsoleProgress {
    fn status(&self, message: &str) {
        // a status line that can't be printed must not fail the run
        let _ = self.multi.println(message);
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.cmd {
        Command::Unpack {
            image,
            output,
            no_chown,
        } => {
            let layout = ImageLayout::open(image)?;
            let manifest = layout.manifest(args.reference.as_deref())?;
            let layers = layout.layers(&manifest)?;

            let mut unpacker = Unpacker::new(output);
            if no_chown {
                unpacker = unpacker.restore_owner(false);
            }

            let progress = ConsoleProgress {
                multi: MultiProgress::new(),
            };
            unpacker.unpack(&layers, &progress)?;
        }
        Command::Layers { image } => {
            let layout = ImageLayout::open(image)?;
            let manifest = layout.manifest(args.reference.as_deref())?;
            for layer in layout.layers(&manifest)? {
                println!(
                    "sha256:{} {} {}",
                    hex::encode(layer.sha256()),
                    layer.media_type(),
                    layer.size()
                );
            }
        }
        Command::LsLayer { image, layer } => {
            let layout = ImageLayout::open(image)?;
            let manifest = layout.manifest(args.reference.as_deref())?;
            let layers = layout.layers(&manifest)?;
            let Some(layer) = layers.get(layer) else {
                bail!("Image has {} layers", layers.len());
            };
            oci::ls_layer(layer)?;
        }
    }
    Ok(())
}
