use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;

use super::{append_file, stem, with_extension, Converter, ConverterKind};
use crate::build::BuildContext;
use crate::image::{DiskImage, GceImage, Image};
use crate::process::CommandSpec;
use crate::tools::{Tool, GCLOUD, GSUTIL, QEMU_IMG};

fn disk(image: &Image) -> Result<&DiskImage> {
    match image {
        Image::Qemu(disk) => Ok(disk),
        other => bail!("expected a qemu disk image, got {}", other.kind()),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// `qemu-img convert` between disk formats.
pub(crate) fn qemu_img_convert(
    ctx: &BuildContext<'_>,
    src: &str,
    src_format: Option<&str>,
    dst: &Path,
    dst_format: &str,
    options: &[&str],
) -> Result<()> {
    let mut cmd = CommandSpec::new(ctx.tool(QEMU_IMG, None)).arg("convert");
    if let Some(fmt) = src_format {
        cmd = cmd.args(["-f", fmt]);
    }
    cmd = cmd.args(["-O", dst_format]);
    for opt in options {
        cmd = cmd.args(["-o", opt]);
    }
    ctx.run(&cmd.arg(src).path_arg(dst))?;
    Ok(())
}

/// Qemu disk to another path or format.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskConverter;

impl Converter for DiskConverter {
    fn kind(&self) -> ConverterKind {
        ConverterKind::DiskToDisk
    }

    fn required_tools(&self) -> Vec<Tool> {
        vec![QEMU_IMG]
    }

    fn convert(&self, ctx: &BuildContext<'_>, source: &Image, target: &Image) -> Result<Image> {
        let src = disk(source)?;
        let dst = disk(target)?;
        let src_path = src.path.clone().context("source disk has no path")?;
        let src_format = src.format.clone().unwrap_or_else(|| "qcow2".to_string());
        let format = dst.format.clone().unwrap_or_else(|| src_format.clone());
        let path = dst
            .path
            .clone()
            .unwrap_or_else(|| with_extension(&src_path, &format));

        let result = Image::Qemu(DiskImage {
            path: Some(path.clone()),
            format: Some(format.clone()),
            checksum: None,
        });

        if path == src_path {
            if format == src_format {
                info!("{} is already {}, nothing to convert", src_path, format);
                return Ok(source.clone());
            }
            bail!("refusing to convert {} to {} in place", src_path, format);
        }
        if ctx.dry_run {
            return Ok(result);
        }

        let dst_path = PathBuf::from(&path);
        ensure_parent(&dst_path)?;
        qemu_img_convert(ctx, &src_path, Some(&src_format), &dst_path, &format, &[])?;
        Ok(result)
    }
}

/// GCE image names: lowercase letters, digits and dashes, starting with a letter.
fn gce_image_name(raw: &str) -> String {
    let mut name: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        name.insert_str(0, "img-");
    }
    name.truncate(63);
    name.trim_end_matches('-').to_string()
}

/// Write `disk` into a gzip tar as `disk.raw`, the layout GCE imports.
pub(crate) fn pack_gce_archive(disk: &Path, archive: &Path) -> Result<()> {
    let out = File::create(archive)
        .with_context(|| format!("Failed to create {}", archive.display()))?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append_file(&mut builder, tar::Header::new_gnu(), disk, "disk.raw")?;
    let encoder = builder
        .into_inner()
        .with_context(|| format!("finishing {}", archive.display()))?;
    encoder
        .finish()
        .with_context(|| format!("compressing {}", archive.display()))?;
    Ok(())
}

/// Qemu disk to a GCE image via a bucket upload.
#[derive(Debug, Default, Clone, Copy)]
pub struct GceImport;

impl Converter for GceImport {
    fn kind(&self) -> ConverterKind {
        ConverterKind::DiskToGce
    }

    fn required_tools(&self) -> Vec<Tool> {
        vec![QEMU_IMG, GSUTIL, GCLOUD]
    }

    fn convert(&self, ctx: &BuildContext<'_>, source: &Image, target: &Image) -> Result<Image> {
        let src = disk(source)?;
        let Image::Gce(gce) = target else {
            bail!("expected a gce target, got {}", target.kind());
        };
        let src_path = src.path.clone().context("source disk has no path")?;
        let project = gce
            .project
            .clone()
            .context("gce output needs 'project'")?;
        let bucket = gce
            .bucket
            .clone()
            .context("gce output needs 'bucket' to stage the disk")?;
        let image = gce
            .image
            .clone()
            .unwrap_or_else(|| gce_image_name(&stem(&src_path)));
        let uri = format!("gs://{}/{}.tar.gz", bucket.trim_end_matches('/'), image);

        let result = Image::Gce(GceImage {
            project: Some(project.clone()),
            image: Some(image.clone()),
            bucket: Some(bucket),
        });
        if ctx.dry_run {
            info!("dry run: would import {} as {} via {}", src_path, result, uri);
            return Ok(result);
        }

        let scratch = ctx.scratch("gce")?;
        let raw = scratch.join("disk.raw");
        qemu_img_convert(ctx, &src_path, src.format.as_deref(), &raw, "raw", &[])?;
        let archive = scratch.join(&format!("{image}.tar.gz"));
        pack_gce_archive(&raw, &archive)?;

        ctx.run(
            &CommandSpec::new(ctx.tool(GSUTIL, None))
                .arg("cp")
                .path_arg(&archive)
                .arg(&uri),
        )?;
        ctx.run(
            &CommandSpec::new(ctx.tool(GCLOUD, None))
                .args(["compute", "images", "create", &image])
                .args(["--project", &project])
                .args(["--source-uri", &uri])
                .arg("--quiet"),
        )?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{context, qemu_input};
    use crate::engine::EngineKind;
    use crate::process::testing::RecordingRunner;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn raw_target() -> Image {
        Image::Qemu(DiskImage {
            format: Some("raw".into()),
            ..Default::default()
        })
    }

    #[test]
    fn same_path_and_format_is_a_no_op() {
        let runner = RecordingRunner::new();
        let ctx = context(&runner, EngineKind::Noop, qemu_input("/out/a.qcow2"), false);
        let target = Image::Qemu(DiskImage::default());
        let out = DiskConverter.convert(&ctx, &ctx.input, &target).unwrap();
        assert_eq!(out, ctx.input);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn converts_format() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.qcow2").display().to_string();
        let runner = RecordingRunner::new();
        let ctx = context(&runner, EngineKind::Noop, qemu_input(&src), false);
        let out = DiskConverter.convert(&ctx, &ctx.input, &raw_target()).unwrap();
        assert_eq!(out.to_string(), tmp.path().join("a.raw").display().to_string());
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(&calls[0].args[..5], ["convert", "-f", "qcow2", "-O", "raw"]);
    }

    #[test]
    fn gce_requires_project_and_bucket() {
        let runner = RecordingRunner::new();
        let ctx = context(&runner, EngineKind::Noop, qemu_input("/out/a.qcow2"), true);
        let target = Image::Gce(GceImage {
            project: Some("proj".into()),
            ..Default::default()
        });
        let err = GceImport.convert(&ctx, &ctx.input, &target).unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn gce_import_uploads_and_creates() {
        let runner = RecordingRunner::new().respond("qemu-img", |spec| {
            fs::write(spec.args.last().unwrap(), b"raw disk bytes").unwrap();
            crate::process::CommandOutput::ok("")
        });
        let ctx = context(&runner, EngineKind::Noop, qemu_input("/out/Ubuntu_1804.qcow2"), false);
        let target = Image::Gce(GceImage {
            project: Some("proj".into()),
            image: None,
            bucket: Some("stage".into()),
        });
        let out = GceImport.convert(&ctx, &ctx.input, &target).unwrap();
        assert_eq!(out.to_string(), "proj/ubuntu-1804");
        assert_eq!(runner.programs(), ["qemu-img", "gsutil", "gcloud"]);
        let calls = runner.calls();
        assert_eq!(calls[1].args[2], "gs://stage/ubuntu-1804.tar.gz");
    }

    #[test]
    fn gce_archive_holds_disk_raw() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("x.raw");
        fs::write(&disk, b"0123456789").unwrap();
        let archive = tmp.path().join("x.tar.gz");
        pack_gce_archive(&disk, &archive).unwrap();

        let mut tar = tar::Archive::new(GzDecoder::new(File::open(&archive).unwrap()));
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, ["disk.raw"]);
    }

    #[test]
    fn gce_names() {
        assert_eq!(gce_image_name("Ubuntu_18.04"), "ubuntu-18-04");
        assert_eq!(gce_image_name("1804"), "img-1804");
    }
}
