use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use super::{Converter, ConverterKind};
use crate::build::{now_utc_compact, BuildContext};
use crate::image::{AmiImage, Image};
use crate::process::CommandSpec;
use crate::tools::{Tool, AWS};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CopyImageResponse {
    image_id: String,
}

/// AMI to another region with `aws ec2 copy-image`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmiCopy;

impl Converter for AmiCopy {
    fn kind(&self) -> ConverterKind {
        ConverterKind::AmiToAmi
    }

    fn required_tools(&self) -> Vec<Tool> {
        vec![AWS]
    }

    fn convert(&self, ctx: &BuildContext<'_>, source: &Image, target: &Image) -> Result<Image> {
        let (Image::Ami(src), Image::Ami(dst)) = (source, target) else {
            bail!("expected ami images, got {} -> {}", source.kind(), target.kind());
        };
        let src_region = src.region.clone().context("source ami has no region")?;
        let src_id = src.id.clone().context("source ami has no id")?;
        let region = dst
            .region
            .clone()
            .context("ami output needs a target 'region'")?;

        if region == src_region {
            info!("{} already lives in {}", source, region);
            return Ok(source.clone());
        }
        if ctx.dry_run {
            return Ok(Image::Ami(AmiImage {
                region: Some(region),
                id: Some("ami-dry-run".to_string()),
            }));
        }

        let name = format!("distro-imager-{}-{}", src_id, now_utc_compact());
        let out = ctx.run(
            &CommandSpec::new(ctx.tool(AWS, None))
                .args(["ec2", "copy-image"])
                .args(["--source-region", &src_region])
                .args(["--source-image-id", &src_id])
                .args(["--region", &region])
                .args(["--name", &name])
                .args(["--output", "json"]),
        )?;
        let response: CopyImageResponse =
            serde_json::from_str(&out.stdout).context("parsing aws ec2 copy-image output")?;
        Ok(Image::Ami(AmiImage {
            region: Some(region),
            id: Some(response.image_id),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::context;
    use crate::engine::EngineKind;
    use crate::process::testing::RecordingRunner;
    use crate::process::CommandOutput;

    fn ami(region: Option<&str>, id: Option<&str>) -> Image {
        Image::Ami(AmiImage {
            region: region.map(str::to_string),
            id: id.map(str::to_string),
        })
    }

    #[test]
    fn same_region_is_a_no_op() {
        let runner = RecordingRunner::new();
        let input = ami(Some("us-east-1"), Some("ami-1"));
        let ctx = context(&runner, EngineKind::Noop, input.clone(), false);
        let out = AmiCopy
            .convert(&ctx, &input, &ami(Some("us-east-1"), None))
            .unwrap();
        assert_eq!(out, input);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn region_is_required() {
        let runner = RecordingRunner::new();
        let input = ami(Some("us-east-1"), Some("ami-1"));
        let ctx = context(&runner, EngineKind::Noop, input.clone(), true);
        let err = AmiCopy.convert(&ctx, &input, &ami(None, None)).unwrap_err();
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn copies_across_regions() {
        let runner = RecordingRunner::new()
            .respond("aws", |_| CommandOutput::ok(r#"{"ImageId": "ami-copied"}"#));
        let input = ami(Some("us-east-1"), Some("ami-1"));
        let ctx = context(&runner, EngineKind::Noop, input.clone(), false);
        let out = AmiCopy
            .convert(&ctx, &input, &ami(Some("eu-west-1"), None))
            .unwrap();
        assert_eq!(out.to_string(), "eu-west-1:ami-copied");
        let calls = runner.calls();
        assert_eq!(&calls[0].args[..2], ["ec2", "copy-image"]);
        assert!(calls[0].args.contains(&"--source-image-id".to_string()));
    }
}
