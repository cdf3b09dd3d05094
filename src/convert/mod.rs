//! Image-format conversion.
//!
//! A converter is chosen by the `(from, to)` kind pair. The chain applies one
//! conversion per requested output, in order, each starting from the previous
//! step's result. Converted targets default to the source path with the
//! target's extension, so converting `K -> A -> B` lands on the same `B` as
//! converting `K -> B` directly.

mod ami;
mod disk;
mod ova;

pub use ami::AmiCopy;
pub use disk::{DiskConverter, GceImport};
pub use ova::{OvaExport, OvaImport};

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::build::BuildContext;
use crate::error::BuildError;
use crate::image::{Image, ImageKind};
use crate::preflight::check_required_tools;
use crate::tools::Tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterKind {
    DiskToDisk,
    DiskToOva,
    OvaToDisk,
    DiskToGce,
    AmiToAmi,
}

impl ConverterKind {
    /// The converter for a kind pair, if one exists.
    pub fn select(from: ImageKind, to: ImageKind) -> Option<ConverterKind> {
        match (from, to) {
            (ImageKind::Qemu, ImageKind::Qemu) => Some(ConverterKind::DiskToDisk),
            (ImageKind::Qemu, ImageKind::Ova) => Some(ConverterKind::DiskToOva),
            (ImageKind::Ova, ImageKind::Qemu) => Some(ConverterKind::OvaToDisk),
            (ImageKind::Qemu, ImageKind::Gce) => Some(ConverterKind::DiskToGce),
            (ImageKind::Ami, ImageKind::Ami) => Some(ConverterKind::AmiToAmi),
            _ => None,
        }
    }
}

/// Turns a realized image into another kind.
pub trait Converter: Send + Sync {
    fn kind(&self) -> ConverterKind;

    fn required_tools(&self) -> Vec<Tool>;

    /// Produce `target` from `source`. `target` may be partial; unset fields
    /// are derived from the source. With `ctx.dry_run` set, compute the result
    /// without external effects.
    fn convert(&self, ctx: &BuildContext<'_>, source: &Image, target: &Image) -> Result<Image>;
}

/// Fixed table of every converter.
#[derive(Debug, Default)]
pub struct ConverterRegistry {
    disk: DiskConverter,
    ova_export: OvaExport,
    ova_import: OvaImport,
    gce: GceImport,
    ami: AmiCopy,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: ConverterKind) -> &dyn Converter {
        match kind {
            ConverterKind::DiskToDisk => &self.disk,
            ConverterKind::DiskToOva => &self.ova_export,
            ConverterKind::OvaToDisk => &self.ova_import,
            ConverterKind::DiskToGce => &self.gce,
            ConverterKind::AmiToAmi => &self.ami,
        }
    }

    pub fn select(&self, from: ImageKind, to: ImageKind) -> crate::error::Result<&dyn Converter> {
        ConverterKind::select(from, to)
            .map(|kind| self.get(kind))
            .ok_or_else(|| BuildError::UnsupportedConversion {
                from: from.to_string(),
                to: to.to_string(),
            })
    }
}

/// Result of running the chain. `produced` holds every output finished
/// before a failure.
#[derive(Debug)]
pub struct ChainOutcome {
    pub produced: Vec<Image>,
    pub result: crate::error::Result<Image>,
}

/// Sequential conversion over the requested outputs.
pub struct ConversionChain<'a> {
    converters: &'a ConverterRegistry,
}

impl<'a> ConversionChain<'a> {
    pub fn new(converters: &'a ConverterRegistry) -> Self {
        Self { converters }
    }

    /// Convert `start` into each of `outputs` in turn. `on_step` is called
    /// with the output index before each step runs.
    pub fn run<F>(
        &self,
        ctx: &BuildContext<'_>,
        start: Image,
        outputs: &[Image],
        mut on_step: F,
    ) -> ChainOutcome
    where
        F: FnMut(usize),
    {
        let mut produced = Vec::with_capacity(outputs.len());
        let mut current = start;
        for (index, target) in outputs.iter().enumerate() {
            on_step(index);
            match self.step(ctx, index, &current, target) {
                Ok(next) => {
                    produced.push(next.clone());
                    current = next;
                }
                Err(err) => {
                    return ChainOutcome {
                        produced,
                        result: Err(err),
                    }
                }
            }
        }
        ChainOutcome {
            produced,
            result: Ok(current),
        }
    }

    fn step(
        &self,
        ctx: &BuildContext<'_>,
        index: usize,
        current: &Image,
        target: &Image,
    ) -> crate::error::Result<Image> {
        ctx.cancel.check(&format!("conversion {index}"))?;
        let (from, to) = (current.kind(), target.kind());
        let converter = self.converters.select(from, to)?;
        let failed = |source: anyhow::Error| BuildError::ConversionFailed {
            from: from.to_string(),
            to: to.to_string(),
            source,
        };

        if !ctx.dry_run {
            let tools: Vec<(Tool, Option<&str>)> = converter
                .required_tools()
                .into_iter()
                .map(|tool| (tool, None))
                .collect();
            check_required_tools(&tools).map_err(failed)?;
        }

        info!("converting {} {} -> {}", from, current, to);
        let next = converter.convert(ctx, current, target).map_err(failed)?;
        next.require_complete()?;
        info!("converted: {}", next);
        Ok(next)
    }
}

/// `source` with its extension replaced by `ext`.
pub(crate) fn with_extension(source: &str, ext: &str) -> String {
    PathBuf::from(source)
        .with_extension(ext)
        .display()
        .to_string()
}

/// File stem of `path`, or `image` if it has none.
pub(crate) fn stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

/// SHA256 hex digest and size of a file.
pub(crate) fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Append a regular file under `name` with a reproducible header.
pub(crate) fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    mut header: tar::Header,
    path: &Path,
    name: &str,
) -> Result<()> {
    let mut f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let len = f.metadata()?.len();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(len);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, &mut f)
        .with_context(|| format!("adding {} to archive", name))?;
    Ok(())
}
