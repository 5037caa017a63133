#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ffl_core::{AllocStrategy, Filer, SlotInfo};
use ffl_region::FileFlashRegion;
use ffl_types::SlotKind;
use serde::Serialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize)]
struct ListOutput {
    region_len: u32,
    free_bytes: u32,
    slots: Vec<SlotInfo>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "create" => {
            let (Some(image), Some(size)) = (args.next(), args.next()) else {
                bail!("create requires <image-path> <size-bytes>");
            };
            create(Path::new(&image), &size)
        }
        "list" => {
            let Some(image) = args.next() else {
                bail!("list requires an image path");
            };
            let json = args.any(|arg| arg == "--json");
            list(Path::new(&image), json)
        }
        "store" => {
            let (Some(image), Some(name), Some(kind), Some(file)) =
                (args.next(), args.next(), args.next(), args.next())
            else {
                bail!("store requires <image-path> <name> <kind> <payload-file>");
            };
            let first_fit = args.any(|arg| arg == "--first-fit");
            store(Path::new(&image), &name, &kind, Path::new(&file), first_fit)
        }
        "extract" => {
            let (Some(image), Some(name), Some(out)) = (args.next(), args.next(), args.next())
            else {
                bail!("extract requires <image-path> <name> <output-file>");
            };
            extract(Path::new(&image), &name, Path::new(&out))
        }
        "delete" => {
            let (Some(image), Some(name)) = (args.next(), args.next()) else {
                bail!("delete requires <image-path> <name>");
            };
            delete(Path::new(&image), &name)
        }
        "free" => {
            let Some(image) = args.next() else {
                bail!("free requires an image path");
            };
            free(Path::new(&image))
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("ffl — flash slot-chain image tool\n");
    println!("USAGE:");
    println!("  ffl create <image-path> <size-bytes>");
    println!("  ffl list <image-path> [--json]");
    println!("  ffl store <image-path> <name> <kind> <payload-file> [--first-fit]");
    println!("  ffl extract <image-path> <name> <output-file>");
    println!("  ffl delete <image-path> <name>");
    println!("  ffl free <image-path>");
    println!();
    println!("KINDS: mod1 mod2 rom writable-rom user-memory-image module-map");
    println!("       global-settings tracer-settings");
}

fn open_filer(image: &Path) -> Result<Filer<FileFlashRegion>> {
    let region = FileFlashRegion::open(image)
        .with_context(|| format!("failed to open image {}", image.display()))?;
    Filer::new(region).context("image has invalid geometry")
}

fn parse_kind(kind: &str) -> Result<SlotKind> {
    Ok(match kind {
        "mod1" => SlotKind::Mod1,
        "mod2" => SlotKind::Mod2,
        "rom" => SlotKind::Rom,
        "writable-rom" => SlotKind::WritableRom,
        "user-memory-image" => SlotKind::UserMemoryImage,
        "module-map" => SlotKind::ModuleMap,
        "global-settings" => SlotKind::GlobalSettings,
        "tracer-settings" => SlotKind::TracerSettings,
        _ => bail!("unknown slot kind: {kind}"),
    })
}

fn create(image: &Path, size: &str) -> Result<()> {
    let size: u32 = size
        .parse()
        .with_context(|| format!("invalid size: {size}"))?;
    FileFlashRegion::create(image, size)
        .with_context(|| format!("failed to create image {}", image.display()))?;
    println!("created {} ({size} bytes, erased)", image.display());
    Ok(())
}

fn list(image: &Path, json: bool) -> Result<()> {
    let filer = open_filer(image)?;
    let slots = filer.list_all().context("chain walk failed")?;
    let free_bytes = filer.free_bytes_total().context("chain walk failed")?;

    if json {
        let output = ListOutput {
            region_len: filer.region_len(),
            free_bytes,
            slots,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{:<10} {:<20} {:<18} {:>10}", "OFFSET", "NAME", "KIND", "SIZE");
    for slot in &slots {
        println!(
            "{:<10} {:<20} {:<18} {:>10}",
            slot.offset.to_string(),
            if slot.name.is_empty() { "-" } else { &slot.name },
            slot.kind.to_string(),
            slot.size
        );
    }
    println!("\n{free_bytes} bytes free of {}", filer.region_len());
    Ok(())
}

fn store(image: &Path, name: &str, kind: &str, file: &Path, first_fit: bool) -> Result<()> {
    let kind = parse_kind(kind)?;
    let payload =
        fs::read(file).with_context(|| format!("failed to read payload {}", file.display()))?;
    let strategy = if first_fit {
        AllocStrategy::FirstFit
    } else {
        AllocStrategy::LastFree
    };

    let filer = open_filer(image)?;
    let offset = filer
        .commit(kind, name, &payload, strategy)
        .with_context(|| format!("failed to store {name}"))?;
    let info = filer.find_by_name(name).context("stored slot vanished")?;
    println!("stored {name} at {offset} ({} bytes including header)", info.size);
    Ok(())
}

fn extract(image: &Path, name: &str, out: &Path) -> Result<()> {
    let filer = open_filer(image)?;
    let payload = filer
        .read_payload(name)
        .with_context(|| format!("failed to read {name}"))?;
    fs::write(out, &payload)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("extracted {name} to {} ({} bytes)", out.display(), payload.len());
    Ok(())
}

fn delete(image: &Path, name: &str) -> Result<()> {
    let filer = open_filer(image)?;
    filer
        .delete(name)
        .with_context(|| format!("failed to delete {name}"))?;
    println!("deleted {name}");
    Ok(())
}

fn free(image: &Path) -> Result<()> {
    let filer = open_filer(image)?;
    let free_bytes = filer.free_bytes_total().context("chain walk failed")?;
    println!("{free_bytes}");
    Ok(())
}
