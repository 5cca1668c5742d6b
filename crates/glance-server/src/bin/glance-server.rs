// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Glance live-preview server.
//!
//! Shows pre-built GLB files (given as `NAME=PATH` or bundled in a GLBS file)
//! and serves them to browser viewers until a termination signal arrives, or
//! exports them as a static GLBS file / a directory of GLBs and exits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use futures_util::TryStreamExt;
use glance_config::{ConfigService, FsConfigStore};
use glance_proto::glbs::GlbsReader;
use glance_scene::{BuildCache, SceneObject, SceneRegistry, ShowOptions};
use glance_server::{
    wait_for_shutdown_signal, NoGeometryEngine, Server, Settings, SettingsArgs,
};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Glance live-preview server")]
struct Args {
    /// Objects to show, as NAME=PATH.glb
    #[arg(value_parser = parse_object)]
    objects: Vec<(String, PathBuf)>,
    /// Also show every blob of this GLBS file, named <stem>_<index>
    #[arg(long)]
    glbs: Option<PathBuf>,
    /// Write the scene to this GLBS file and exit
    #[arg(long, conflicts_with = "export_dir")]
    export_glbs: Option<PathBuf>,
    /// Write one NAME.glb per object into this directory and exit
    #[arg(long)]
    export_dir: Option<PathBuf>,
    /// Ignore the persisted config
    #[arg(long)]
    no_config: bool,
    /// Persist the effective settings before starting
    #[arg(long, conflicts_with = "no_config")]
    save_config: bool,
    #[command(flatten)]
    settings: SettingsArgs,
}

fn parse_object(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let mut args = Args::parse();
    let settings = resolve_settings(&mut args)?;
    let objects = load_objects(&args, settings.max_blob_bytes).await?;

    if args.export_glbs.is_some() || args.export_dir.is_some() {
        return export(&args, &settings, objects).await;
    }

    let engine = Arc::new(NoGeometryEngine);
    let server = Server::start(settings, engine.clone(), engine)
        .await
        .context("start server")?;
    if !objects.is_empty() {
        server
            .registry()
            .show(objects, &ShowOptions::default())
            .context("show objects")?;
    }
    info!(url = %server.url(), "open the viewer at this address");

    wait_for_shutdown_signal()
        .await
        .context("install signal handlers")?;
    info!("termination signal received");
    server.stop().await.context("stop server")?;
    Ok(())
}

fn resolve_settings(args: &mut Args) -> Result<Settings> {
    let overrides = std::mem::take(&mut args.settings);
    if args.no_config {
        let mut settings = Settings::default();
        overrides.apply(&mut settings);
        settings.validate()?;
        return Ok(settings);
    }
    let config = ConfigService::new(FsConfigStore::new().context("open config directory")?);
    let mut settings = Settings::load(&config).context("load persisted settings")?;
    overrides.apply(&mut settings);
    settings.validate()?;
    if args.save_config {
        settings.save(&config).context("save settings")?;
        info!(dir = %config.store().base().display(), "settings saved");
    }
    Ok(settings)
}

async fn read_blob(path: &Path, max_bytes: usize) -> Result<Bytes> {
    let len = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if len > u64::try_from(max_bytes).unwrap_or(u64::MAX) {
        bail!(
            "{} is {len} bytes, larger than the {max_bytes} byte limit",
            path.display()
        );
    }
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    Ok(Bytes::from(data))
}

async fn load_objects(args: &Args, max_bytes: usize) -> Result<Vec<(String, SceneObject)>> {
    let mut objects = Vec::new();
    for (name, path) in &args.objects {
        let blob = read_blob(path, max_bytes).await?;
        objects.push((name.clone(), SceneObject::RawBytes(blob)));
    }
    if let Some(path) = &args.glbs {
        let stem = path
            .file_stem()
            .map_or_else(|| "glbs".to_string(), |s| s.to_string_lossy().into_owned());
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let reader = GlbsReader::with_max_blob(data.as_slice(), max_bytes)
            .with_context(|| format!("parse {}", path.display()))?;
        for (index, blob) in reader.enumerate() {
            let blob = blob.with_context(|| format!("parse {}", path.display()))?;
            objects.push((format!("{stem}_{index}"), SceneObject::RawBytes(blob)));
        }
    }
    if objects.is_empty() {
        warn!("no objects given; the scene starts empty");
    }
    Ok(objects)
}

fn file_name(object: &str) -> String {
    object
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

async fn export(
    args: &Args,
    settings: &Settings,
    objects: Vec<(String, SceneObject)>,
) -> Result<()> {
    let registry = Arc::new(SceneRegistry::with_history_cap(
        settings.render_defaults()?,
        settings.history_cap,
    ));
    registry
        .show(objects, &ShowOptions::default())
        .context("show objects")?;
    let engine = Arc::new(NoGeometryEngine);
    let cache = BuildCache::new(registry, engine.clone(), engine, settings.build_workers);

    if let Some(path) = &args.export_glbs {
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("create {}", path.display()))?;
        let mut chunks = Box::pin(cache.export_glbs(|_, _| true));
        while let Some(chunk) = chunks.try_next().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        info!(path = %path.display(), "scene exported");
    }
    if let Some(dir) = &args.export_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
        let mut artifacts = Vec::new();
        cache
            .export_all(
                |_, _| true,
                |name, artifact| {
                    artifacts.push((name.to_string(), artifact));
                    Ok(())
                },
            )
            .await?;
        for (name, artifact) in artifacts {
            let path = dir.join(format!("{}.glb", file_name(&name)));
            tokio::fs::write(&path, &artifact.bytes)
                .await
                .with_context(|| format!("write {}", path.display()))?;
        }
        info!(dir = %dir.display(), "objects exported");
    }
    Ok(())
}
