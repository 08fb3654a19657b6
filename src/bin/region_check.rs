//! region_check - Show which configured regions a person box lands in.
//!
//! Prints the footprint strip used for the region join, every overlapped
//! region, and whether each one is subscribed for presence notifications.
//! Useful when drawing region polygons for a new camera.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;

use presence_kernel::config::PresenceConfig;
use presence_kernel::{footprint, BBox};

#[derive(Parser, Debug)]
#[command(
    name = "region_check",
    about = "Print footprint and overlapping regions for a person bounding box"
)]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "PRESENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Camera name as configured.
    #[arg(long)]
    camera: String,

    /// Person box in pixels.
    #[arg(long, value_name = "X1,Y1,X2,Y2")]
    bbox: BBox,

    /// Override the configured footprint ratio.
    #[arg(long)]
    footprint_ratio: Option<f64>,

    /// Emit JSON instead of text.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let cfg = PresenceConfig::load_from(args.config.as_deref()).context("load configuration")?;
    let catalog = cfg.catalog();
    let camera = catalog.get(&args.camera).ok_or_else(|| {
        anyhow!(
            "unknown camera '{}' (configured: {})",
            args.camera,
            catalog.names().join(", ")
        )
    })?;

    let ratio = args.footprint_ratio.unwrap_or(cfg.footprint_ratio);
    if !(ratio > 0.0 && ratio <= 1.0) {
        return Err(anyhow!("footprint ratio must be in (0, 1], got {}", ratio));
    }
    let foot = footprint(&args.bbox, ratio);
    let regions = camera.regions_for(&args.bbox, ratio);

    if args.json {
        let overlaps: Vec<_> = regions
            .iter()
            .map(|name| json!({ "region": name, "subscribed": camera.is_subscribed(name) }))
            .collect();
        let out = json!({
            "camera": camera.name,
            "bbox": args.bbox,
            "footprint": foot,
            "footprint_ratio": ratio,
            "regions": overlaps,
            "timeout_secs": camera.timeout.as_secs(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("camera:    {}", camera.name);
    println!(
        "bbox:      ({}, {}, {}, {})",
        args.bbox.x1, args.bbox.y1, args.bbox.x2, args.bbox.y2
    );
    println!(
        "footprint: ({}, {}, {}, {})  [ratio {}]",
        foot.x1, foot.y1, foot.x2, foot.y2, ratio
    );
    if regions.is_empty() {
        println!("regions:   none");
        return Ok(());
    }
    println!("regions:");
    for name in &regions {
        let marker = if camera.is_subscribed(name) {
            "subscribed"
        } else {
            "not subscribed"
        };
        println!("  - {} ({})", name, marker);
    }
    Ok(())
}
