//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use clipcache_service::caching::{CacheKey, CacheStats, SynthesisError};
use clipcache_service::config::Config;
use clipcache_service::metrics;
use clipcache_service::services::synthesizer::Synthesizer;
use clipcache_service::services::{AzureSynthesizer, ClipService};
use console::style;
use futures::future::BoxFuture;

use crate::logging;

/// Clipcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Print the size and contents of the cache.
    Stats {
        /// Print the statistics as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Look up a cached clip without synthesizing it.
    Lookup {
        /// The text that was spoken.
        text: String,

        /// The language the clip was synthesized in.
        #[arg(long, short)]
        language: String,

        /// Write the audio to this file.
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Return a clip, synthesizing it if it is not cached.
    Fetch {
        /// The text to be spoken.
        text: String,

        /// The language to speak the text in.
        #[arg(long, short)]
        language: String,

        /// Write the audio to this file.
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Synthesize the clip again even if it is cached.
        #[arg(long)]
        force: bool,
    },

    /// List the default voice the speech service offers per locale.
    Voices {
        /// Only show voices whose locale starts with this prefix.
        #[arg(long, short)]
        language: Option<String>,
    },

    /// Delete a single clip.
    Delete {
        /// The text that was spoken.
        text: String,

        /// The language the clip was synthesized in.
        #[arg(long, short)]
        language: String,
    },

    /// Shrink the cache below its size budget.
    Evict,

    /// Print the cache key for a clip.
    Key {
        /// The text to be spoken.
        text: String,

        /// The language of the clip.
        #[arg(long, short)]
        language: String,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Stands in for the speech service when none is configured.
#[derive(Debug)]
struct OfflineSynthesizer;

impl Synthesizer for OfflineSynthesizer {
    fn synthesize<'a>(
        &'a self,
        _text: &'a str,
        _language_code: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, SynthesisError>> {
        Box::pin(async { Err(SynthesisError::new("synthesis is not available offline")) })
    }
}

/// Creates the configured synthesizer, or one that always fails without a speech service.
fn create_synthesizer(config: &Config) -> Result<Arc<dyn Synthesizer>> {
    match &config.azure {
        Some(azure) => {
            let synthesizer =
                AzureSynthesizer::new(azure).context("invalid azure configuration")?;
            Ok(Arc::new(synthesizer))
        }
        None => Ok(Arc::new(OfflineSynthesizer)),
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    // SAFETY: This is called before any threads are spawned.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
    }

    if let Command::Key { text, language } = &cli.command {
        print_key(text, language);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("clipcache")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: Config) -> Result<()> {
    if let Command::Voices { language } = &command {
        return list_voices(&config, language.as_deref()).await;
    }

    let synthesizer = create_synthesizer(&config)?;
    let service = ClipService::create(&config, synthesizer)
        .with_context(|| format!("failed to open {}", config.database.path.display()))?;

    let result = match command {
        Command::Stats { json } => {
            let stats = service.get_stats().await.context("failed to collect stats")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&stats);
            }
            Ok(())
        }
        Command::Lookup {
            text,
            language,
            output,
        } => lookup(&service, &text, &language, output.as_deref()).await,
        Command::Fetch {
            text,
            language,
            output,
            force,
        } => fetch(&service, &text, &language, output.as_deref(), force).await,
        Command::Delete { text, language } => {
            let outcome = service
                .delete(&text, &language)
                .await
                .context("failed to delete clip")?;
            if outcome.deleted {
                println!("deleted {}", style(&outcome.key).cyan());
            } else {
                println!("{} was not cached", style(&outcome.key).cyan());
            }
            Ok(())
        }
        Command::Evict => {
            let outcome = service.evict_now().await.context("failed to evict clips")?;
            println!(
                "evicted {} clips ({} bytes)",
                outcome.evicted_clips, outcome.evicted_bytes
            );
            Ok(())
        }
        Command::Key { text, language } => {
            print_key(&text, &language);
            Ok(())
        }
        Command::Voices { .. } => Ok(()),
    };

    service.shutdown().await;
    result
}

async fn lookup(
    service: &ClipService,
    text: &str,
    language: &str,
    output: Option<&Path>,
) -> Result<()> {
    let lookup = service
        .get_cached_only(text, language)
        .await
        .context("failed to look up clip")?;

    let Some(audio) = lookup.audio else {
        anyhow::bail!("no cached clip for {}", lookup.key);
    };

    match output {
        Some(path) => {
            std::fs::write(path, &audio)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "wrote {} bytes of {} to {}",
                audio.len(),
                style(&lookup.key).cyan(),
                path.display()
            );
        }
        None => println!("{} is cached ({} bytes)", style(&lookup.key).cyan(), audio.len()),
    }
    Ok(())
}

async fn fetch(
    service: &ClipService,
    text: &str,
    language: &str,
    output: Option<&Path>,
    force: bool,
) -> Result<()> {
    let clip = service
        .get_or_fetch(text, language, force)
        .await
        .context("failed to fetch clip")?;

    let origin = if clip.cached { "cached" } else { "synthesized" };
    match output {
        Some(path) => {
            std::fs::write(path, &clip.audio)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "wrote {} bytes of {} ({origin}) to {}",
                clip.audio.len(),
                style(&clip.key).cyan(),
                path.display()
            );
        }
        None => println!(
            "{} is {origin} ({} bytes)",
            style(&clip.key).cyan(),
            clip.audio.len()
        ),
    }
    Ok(())
}

async fn list_voices(config: &Config, prefix: Option<&str>) -> Result<()> {
    let Some(azure) = &config.azure else {
        anyhow::bail!("no speech service is configured");
    };
    let synthesizer = AzureSynthesizer::new(azure).context("invalid azure configuration")?;
    let voices = synthesizer
        .voices()
        .await
        .context("failed to load the voice list")?;

    for voice in voices.iter() {
        if prefix.is_some_and(|prefix| !voice.locale.starts_with(prefix)) {
            continue;
        }
        println!(
            "{:<8} {} {}",
            voice.locale,
            style(&voice.short_name).cyan(),
            style(&voice.gender).dim()
        );
    }
    Ok(())
}

fn print_key(text: &str, language: &str) {
    let key = CacheKey::for_clip(text, language);
    println!("{}", style(key.to_hex()).cyan());
    println!("{}", style(key.metadata()).dim());
}

fn print_stats(stats: &CacheStats) {
    println!("{}", style("Clips").bold());
    println!("  total:      {}", stats.total_clips);
    println!("  compressed: {}", stats.compressed_clips);
    println!("  size:       {:.2} MiB", stats.size_mb);
    if let (Some(max), Some(usage)) = (stats.max_size_mb, stats.usage_percent) {
        println!("  budget:     {max:.2} MiB ({usage:.1}% used)");
    }

    if !stats.languages.is_empty() {
        println!("{}", style("Languages").bold());
        for (language, usage) in &stats.languages {
            println!("  {language:<8} {:>6} clips {:>12} bytes", usage.clips, usage.bytes);
        }
    }
}
