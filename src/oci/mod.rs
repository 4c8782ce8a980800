pub mod image;
pub mod tar;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use log::debug;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType, OciLayout};

use crate::util::{parse_sha256, Sha256Digest};

pub use image::{Progress, Silent, Unpacker};

/// Annotation carrying the human-readable reference of a manifest in an
/// image index.
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

fn sha256_from_descriptor(descriptor: &Descriptor) -> Result<Sha256Digest> {
    let Some(digest) = descriptor.as_digest_sha256() else {
        bail!("Descriptor digest is not sha256: {}", descriptor.digest());
    };
    Ok(parse_sha256(digest)?)
}

/// A local OCI image-layout directory (the `oci:` transport format): an
/// `oci-layout` version marker, an `index.json`, and content-addressed blobs
/// under `blobs/<algorithm>/<hex>`.
#[derive(Debug)]
pub struct ImageLayout {
    path: PathBuf,
}

impl ImageLayout {
    /// Opens a layout directory, insisting on the version marker so that
    /// arbitrary directories aren't silently treated as images.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let layout = OciLayout::from_file(path.join("oci-layout"))
            .with_context(|| format!("Reading oci-layout marker in {path:?}"))?;
        if layout.image_layout_version() != "1.0.0" {
            bail!(
                "Unsupported image layout version {}",
                layout.image_layout_version()
            );
        }
        debug!("opened image layout at {path:?}");
        Ok(Self { path })
    }

    fn blob_path(&self, sha256: &Sha256Digest) -> PathBuf {
        self.path.join("blobs/sha256").join(hex::encode(sha256))
    }

    /// Resolves the manifest for `reference` from the index, or the index's
    /// only manifest when no reference is given.
    pub fn manifest(&self, reference: Option<&str>) -> Result<ImageManifest> {
        let index = ImageIndex::from_file(self.path.join("index.json"))
            .context("Reading index.json")?;
        let descriptor = select_manifest(&index, reference)?;

        // Nested indices are allowed by the layout format but pointless to
        // flatten; the caller has to pick a concrete image.
        if *descriptor.media_type() == MediaType::ImageIndex {
            bail!("Nested image index not supported");
        }

        let sha256 = sha256_from_descriptor(descriptor)?;
        debug!("resolved manifest sha256:{}", hex::encode(sha256));
        ImageManifest::from_file(self.blob_path(&sha256))
            .with_context(|| format!("Reading manifest sha256:{}", hex::encode(sha256)))
    }

    /// The image's layers, base to top, ready to be opened as tar streams.
    pub fn layers(&self, manifest: &ImageManifest) -> Result<Vec<Layer>> {
        manifest
            .layers()
            .iter()
            .map(|descriptor| {
                let sha256 = sha256_from_descriptor(descriptor)?;
                Ok(Layer {
                    blob: self.blob_path(&sha256),
                    media_type: descriptor.media_type().clone(),
                    size: descriptor.size(),
                    sha256,
                })
            })
            .collect()
    }
}

fn select_manifest<'a>(index: &'a ImageIndex, reference: Option<&str>) -> Result<&'a Descriptor> {
    let manifests = index.manifests();
    if manifests.is_empty() {
        bail!("Image index contains no manifests");
    }

    match reference {
        Some(wanted) => manifests
            .iter()
            .find(|descriptor| {
                descriptor
                    .annotations()
                    .as_ref()
                    .and_then(|annotations| annotations.get(REF_NAME_ANNOTATION))
                    .is_some_and(|name| name == wanted)
            })
            .with_context(|| format!("Reference {wanted:?} not found in image index")),
        None if manifests.len() == 1 => Ok(&manifests[0]),
        None => {
            let available: Vec<&str> = manifests
                .iter()
                .filter_map(|descriptor| {
                    descriptor
                        .annotations()
                        .as_ref()?
                        .get(REF_NAME_ANNOTATION)
                        .map(String::as_str)
                })
                .collect();
            bail!(
                "Image index has {} manifests; pick one with --reference (available: {})",
                manifests.len(),
                available.join(", ")
            );
        }
    }
}

/// One layer blob: its digest (identifying the blob and labelling progress)
/// and the compression its media type declares.
#[derive(Debug)]
pub struct Layer {
    sha256: Sha256Digest,
    media_type: MediaType,
    size: u64,
    blob: PathBuf,
}

impl Layer {
    pub fn sha256(&self) -> &Sha256Digest {
        &self.sha256
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Opens a fresh decompressed tar stream over the layer blob.
    pub fn open_tar(&self) -> Result<Box<dyn Read>> {
        let blob = File::open(&self.blob)
            .with_context(|| format!("Opening layer blob {:?}", self.blob))?;
        let buf = BufReader::new(blob);

        Ok(match &self.media_type {
            MediaType::ImageLayer | MediaType::ImageLayerNonDistributable => Box::new(buf),
            MediaType::ImageLayerGzip | MediaType::ImageLayerNonDistributableGzip => {
                Box::new(GzDecoder::new(buf))
            }
            MediaType::ImageLayerZstd | MediaType::ImageLayerNonDistributableZstd => {
                Box::new(zstd::stream::read::Decoder::new(buf)?)
            }
            other => bail!("Unsupported layer media type {other}"),
        })
    }
}

/// Lists the entries of a single layer on stdout without touching the
/// filesystem.
pub fn ls_layer(layer: &Layer) -> Result<()> {
    tar::list_entries(layer.open_tar()?, &mut std::io::stdout())
}
