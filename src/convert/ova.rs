//! OVA export and import.
//!
//! An OVA is a ustar archive holding, in order, the OVF descriptor, a SHA256
//! manifest (`.mf`) and a streamOptimized vmdk.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{debug, info};

use super::disk::qemu_img_convert;
use super::{append_file, sha256_file, stem, with_extension, Converter, ConverterKind};
use crate::build::BuildContext;
use crate::engine::QemuSettings;
use crate::image::{DiskImage, Image, OvaImage};
use crate::process::CommandSpec;
use crate::tools::{Tool, QEMU_IMG};

const VMDK_FORMAT_URI: &str =
    "http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized";

/// Virtual hardware written into the OVF descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvfSpec {
    pub name: String,
    pub disk_file: String,
    pub disk_size: u64,
    pub capacity: u64,
    pub cpus: u32,
    pub memory_mb: u32,
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render an OVF 1.0 descriptor for a single-disk VM.
pub fn render_ovf(spec: &OvfSpec) -> String {
    let name = xml_escape(&spec.name);
    let disk_file = xml_escape(&spec.disk_file);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1" xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1" xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData" xmlns:vssd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData">
  <References>
    <File ovf:href="{disk_file}" ovf:id="file1" ovf:size="{disk_size}"/>
  </References>
  <DiskSection>
    <Info>Virtual disk information</Info>
    <Disk ovf:capacity="{capacity}" ovf:capacityAllocationUnits="byte" ovf:diskId="vmdisk1" ovf:fileRef="file1" ovf:format="{VMDK_FORMAT_URI}"/>
  </DiskSection>
  <NetworkSection>
    <Info>The list of logical networks</Info>
    <Network ovf:name="nat">
      <Description>The nat network</Description>
    </Network>
  </NetworkSection>
  <VirtualSystem ovf:id="{name}">
    <Info>A virtual machine</Info>
    <Name>{name}</Name>
    <OperatingSystemSection ovf:id="101">
      <Info>The kind of installed guest operating system</Info>
    </OperatingSystemSection>
    <VirtualHardwareSection>
      <Info>Virtual hardware requirements</Info>
      <System>
        <vssd:ElementName>Virtual Hardware Family</vssd:ElementName>
        <vssd:InstanceID>0</vssd:InstanceID>
        <vssd:VirtualSystemIdentifier>{name}</vssd:VirtualSystemIdentifier>
        <vssd:VirtualSystemType>vmx-13</vssd:VirtualSystemType>
      </System>
      <Item>
        <rasd:AllocationUnits>hertz * 10^6</rasd:AllocationUnits>
        <rasd:ElementName>{cpus} virtual CPU(s)</rasd:ElementName>
        <rasd:InstanceID>1</rasd:InstanceID>
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>{cpus}</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:AllocationUnits>byte * 2^20</rasd:AllocationUnits>
        <rasd:ElementName>{memory_mb}MB of memory</rasd:ElementName>
        <rasd:InstanceID>2</rasd:InstanceID>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>{memory_mb}</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:ElementName>SCSI Controller 0</rasd:ElementName>
        <rasd:InstanceID>3</rasd:InstanceID>
        <rasd:ResourceSubType>lsilogic</rasd:ResourceSubType>
        <rasd:ResourceType>6</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:AddressOnParent>0</rasd:AddressOnParent>
        <rasd:ElementName>Hard Disk 1</rasd:ElementName>
        <rasd:HostResource>ovf:/disk/vmdisk1</rasd:HostResource>
        <rasd:InstanceID>4</rasd:InstanceID>
        <rasd:Parent>3</rasd:Parent>
        <rasd:ResourceType>17</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:AutomaticAllocation>true</rasd:AutomaticAllocation>
        <rasd:Connection>nat</rasd:Connection>
        <rasd:ElementName>Ethernet 1</rasd:ElementName>
        <rasd:InstanceID>5</rasd:InstanceID>
        <rasd:ResourceSubType>VmxNet3</rasd:ResourceSubType>
        <rasd:ResourceType>10</rasd:ResourceType>
      </Item>
    </VirtualHardwareSection>
  </VirtualSystem>
</Envelope>
"#,
        disk_size = spec.disk_size,
        capacity = spec.capacity,
        cpus = spec.cpus,
        memory_mb = spec.memory_mb,
    )
}

/// Pack `files` (in order) into a ustar archive at `out`.
pub(crate) fn pack_ova(files: &[PathBuf], out: &Path) -> Result<()> {
    let f = File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
    let mut builder = tar::Builder::new(f);
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        append_file(&mut builder, tar::Header::new_ustar(), path, &name)?;
    }
    builder
        .into_inner()
        .with_context(|| format!("finishing {}", out.display()))?;
    Ok(())
}

fn source_path(image: &Image) -> Result<String> {
    match image {
        Image::Qemu(DiskImage { path: Some(p), .. }) | Image::Ova(OvaImage { path: Some(p) }) => {
            Ok(p.clone())
        }
        other => bail!("{} image has no path", other.kind()),
    }
}

/// Virtual size of a disk, from `qemu-img info`.
fn virtual_size(ctx: &BuildContext<'_>, disk: &str) -> Result<u64> {
    let out = ctx.run(
        &CommandSpec::new(ctx.tool(QEMU_IMG, None))
            .args(["info", "--output=json"])
            .arg(disk),
    )?;
    let info: Value = serde_json::from_str(&out.stdout).context("parsing qemu-img info output")?;
    info.get("virtual-size")
        .and_then(Value::as_u64)
        .context("qemu-img info did not report virtual-size")
}

/// Qemu disk to OVA.
#[derive(Debug, Default, Clone, Copy)]
pub struct OvaExport;

impl Converter for OvaExport {
    fn kind(&self) -> ConverterKind {
        ConverterKind::DiskToOva
    }

    fn required_tools(&self) -> Vec<Tool> {
        vec![QEMU_IMG]
    }

    fn convert(&self, ctx: &BuildContext<'_>, source: &Image, target: &Image) -> Result<Image> {
        let src = source_path(source)?;
        let Image::Ova(ova) = target else {
            bail!("expected an ova target, got {}", target.kind());
        };
        let path = ova.path.clone().unwrap_or_else(|| with_extension(&src, "ova"));
        if path == src {
            bail!("refusing to overwrite {} with an OVA", src);
        }
        let result = Image::Ova(OvaImage {
            path: Some(path.clone()),
        });
        if ctx.dry_run {
            return Ok(result);
        }

        let name = stem(&path);
        let scratch = ctx.scratch("ova")?;
        let vmdk = scratch.join(&format!("{name}-disk1.vmdk"));
        let src_format = match source {
            Image::Qemu(d) => d.format.as_deref(),
            _ => None,
        };
        qemu_img_convert(
            ctx,
            &src,
            src_format,
            &vmdk,
            "vmdk",
            &["subformat=streamOptimized"],
        )?;
        let capacity = virtual_size(ctx, &src)?;

        let (disk_sha, disk_size) = sha256_file(&vmdk)?;
        let hardware = QemuSettings::resolve(ctx);
        let ovf_path = scratch.join(&format!("{name}.ovf"));
        let disk_file = format!("{name}-disk1.vmdk");
        fs::write(
            &ovf_path,
            render_ovf(&OvfSpec {
                name: name.clone(),
                disk_file: disk_file.clone(),
                disk_size,
                capacity,
                cpus: hardware.cpus,
                memory_mb: hardware.memory_mb,
            }),
        )
        .with_context(|| format!("writing {}", ovf_path.display()))?;

        let (ovf_sha, _) = sha256_file(&ovf_path)?;
        let mf_path = scratch.join(&format!("{name}.mf"));
        fs::write(
            &mf_path,
            format!("SHA256({name}.ovf)= {ovf_sha}\nSHA256({disk_file})= {disk_sha}\n"),
        )
        .with_context(|| format!("writing {}", mf_path.display()))?;

        let out = PathBuf::from(&path);
        if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        pack_ova(&[ovf_path, mf_path, vmdk], &out)?;
        info!("wrote {}", out.display());
        Ok(result)
    }
}

/// OVA to a qemu disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct OvaImport;

impl OvaImport {
    /// Extract the first vmdk in `ova` to `dest`.
    fn extract_disk(ova: &Path, dest: &Path) -> Result<()> {
        let f = File::open(ova).with_context(|| format!("Failed to open {}", ova.display()))?;
        let mut archive = tar::Archive::new(f);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let is_vmdk = entry
                .path()?
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("vmdk"));
            if is_vmdk {
                debug!("extracting {} from {}", entry.path()?.display(), ova.display());
                entry
                    .unpack(dest)
                    .with_context(|| format!("Failed to unpack {}", ova.display()))?;
                return Ok(());
            }
        }
        bail!("{} contains no vmdk disk", ova.display())
    }
}

impl Converter for OvaImport {
    fn kind(&self) -> ConverterKind {
        ConverterKind::OvaToDisk
    }

    fn required_tools(&self) -> Vec<Tool> {
        vec![QEMU_IMG]
    }

    fn convert(&self, ctx: &BuildContext<'_>, source: &Image, target: &Image) -> Result<Image> {
        let src = source_path(source)?;
        let Image::Qemu(dst) = target else {
            bail!("expected a qemu target, got {}", target.kind());
        };
        let format = dst.format.clone().unwrap_or_else(|| "qcow2".to_string());
        let path = dst
            .path
            .clone()
            .unwrap_or_else(|| with_extension(&src, &format));
        let result = Image::Qemu(DiskImage {
            path: Some(path.clone()),
            format: Some(format.clone()),
            checksum: None,
        });
        if ctx.dry_run {
            return Ok(result);
        }

        let scratch = ctx.scratch("ova-import")?;
        let vmdk = scratch.join("disk.vmdk");
        Self::extract_disk(Path::new(&src), &vmdk)?;
        let out = PathBuf::from(&path);
        if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        qemu_img_convert(
            ctx,
            &vmdk.display().to_string(),
            Some("vmdk"),
            &out,
            &format,
            &[],
        )?;
        Ok(result)
    }
}
