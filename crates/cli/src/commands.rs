//! One-shot maintenance commands: catalog editing, settings, status, manual sends.

use std::path::Path;

use anyhow::{Context, bail};
use serde_json::Value;
use worm_core::catalog::{CategoryEntries, ResponseCatalog};
use worm_core::config::{Settings, WormCfg};
use worm_core::io::transport::{MotorSink, SendOutcome, SerialTransport};
use worm_core::resolver::CUSTOM_TRIGGER_PULSES;
use worm_core::types::{ResponseEntry, SymbolicCommand, pulses_for_text};

pub fn settings_get(settings: &Settings, key: Option<&str>) -> anyhow::Result<()> {
    let value = match key {
        Some(key) => settings
            .get(key)
            .with_context(|| format!("no setting named {key}"))?,
        None => settings.as_value(),
    };
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `raw` is parsed as JSON when it can be (`0.5`, `true`, `["a"]`), else kept as a string.
pub fn settings_set(settings: &mut Settings, key: &str, raw: &str) -> anyhow::Result<()> {
    let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_owned()));
    settings.set(key, value.clone())?;
    settings.save()?;
    let path = settings.path().map(|p| p.display().to_string()).unwrap_or_default();
    println!("{key} = {value} ({path})");
    Ok(())
}

/// Listing in the style of the old "show responses" tool: text, word count,
/// pulse count and movement for every entry.
pub fn list_responses(catalog: &ResponseCatalog, only: Option<&str>) -> anyhow::Result<()> {
    if let Some(name) = only {
        if catalog.category(name).is_none() && name != "fallbacks" && name != "custom" {
            bail!(
                "unknown category {name}; known: {}",
                catalog.category_names().join(", ")
            );
        }
    }
    let wanted = |name: &str| only.is_none_or(|o| o == name);

    if only.is_none() {
        println!("startup: {}", catalog.startup_message());
    }
    for (name, entries) in catalog.categories() {
        if !wanted(name) {
            continue;
        }
        println!("\n[{name}] {} responses", entries.len());
        match entries {
            CategoryEntries::Flat(list) => print_entries("  ", list),
            CategoryEntries::Grouped(groups) => {
                for (sub, list) in groups {
                    println!("  {sub}:");
                    print_entries("    ", list);
                }
            }
        }
    }
    if wanted("custom") {
        let custom: Vec<_> = catalog.custom_entries().collect();
        println!("\n[custom] {} triggers", custom.len());
        for (i, (trigger, entry)) in custom.into_iter().enumerate() {
            println!("  {i}. \"{trigger}\" -> {}", describe(entry, Bucket::Custom));
        }
    }
    if wanted("fallbacks") {
        println!("\n[fallbacks] {} responses", catalog.fallbacks().len());
        print_entries("  ", catalog.fallbacks());
    }

    let stats = catalog.stats();
    println!(
        "\n{} responses in {} categories, {} custom triggers, {} fallbacks",
        stats.total_responses, stats.categories, stats.custom_triggers, stats.fallbacks
    );
    Ok(())
}

fn print_entries(indent: &str, entries: &[ResponseEntry]) {
    for (i, entry) in entries.iter().enumerate() {
        println!("{indent}{i}. {}", describe(entry, Bucket::Keyword));
    }
}

/// Where an entry lives decides its pulse count when it has none of its own.
#[derive(Clone, Copy)]
enum Bucket {
    Keyword,
    Custom,
}

fn listed_pulses(entry: &ResponseEntry, bucket: Bucket) -> u32 {
    entry.mouth_pulses.unwrap_or_else(|| match bucket {
        Bucket::Keyword => pulses_for_text(&entry.text),
        Bucket::Custom => CUSTOM_TRIGGER_PULSES,
    })
}

fn describe(entry: &ResponseEntry, bucket: Bucket) -> String {
    let words = entry.text.split_whitespace().count();
    let pulses = listed_pulses(entry, bucket);
    let movement = entry
        .movement_code
        .map(|m| m.token().to_owned())
        .unwrap_or_else(|| "-".into());
    format!(
        "{} ({words} words, {pulses} pulses, movement {movement})",
        entry.text
    )
}

pub struct NewResponse<'a> {
    pub category: &'a str,
    pub subcategory: Option<&'a str>,
    pub text: &'a str,
    pub movement: Option<SymbolicCommand>,
    pub trigger: Option<&'a str>,
    pub emotion: Option<&'a str>,
    pub pulses: Option<u32>,
}

pub fn add_response(path: &Path, new: NewResponse<'_>) -> anyhow::Result<()> {
    let mut catalog = load_for_edit(path)?;
    let mut entry = ResponseEntry::new(new.text);
    if let Some(movement) = new.movement {
        entry = entry.with_movement(movement);
    }
    if let Some(trigger) = new.trigger {
        entry = entry.with_trigger(trigger);
    }
    if let Some(emotion) = new.emotion {
        entry = entry.with_emotion(emotion);
    }
    if let Some(pulses) = new.pulses {
        entry = entry.with_pulses(pulses);
    }
    catalog.add_response(new.category, new.subcategory, entry)?;
    catalog.save(path)?;
    println!("added to {} ({} responses total)", new.category, catalog.response_count());
    Ok(())
}

pub fn remove_response(
    path: &Path,
    category: &str,
    subcategory: Option<&str>,
    index: usize,
) -> anyhow::Result<()> {
    let mut catalog = load_for_edit(path)?;
    let removed = catalog.remove_response(category, subcategory, index)?;
    catalog.save(path)?;
    println!("removed: {}", removed.text);
    Ok(())
}

/// Editing needs the real file: a missing one starts from the minimal catalog,
/// a corrupt one is an error rather than being silently replaced.
fn load_for_edit(path: &Path) -> anyhow::Result<ResponseCatalog> {
    if !path.exists() {
        return Ok(ResponseCatalog::minimal());
    }
    ResponseCatalog::load(path).with_context(|| format!("cannot edit {}", path.display()))
}

pub fn send(transport: &SerialTransport, command: SymbolicCommand) -> anyhow::Result<()> {
    let outcome = transport.send(command)?;
    match outcome {
        SendOutcome::Delivered => println!("sent {command} ({})", command.describe()),
        SendOutcome::Simulated => println!("simulated {command} ({}), no controller connected", command.describe()),
    }
    transport.close();
    Ok(())
}

pub struct StatusReport<'a> {
    pub catalog_path: &'a Path,
    pub catalog: &'a ResponseCatalog,
    pub settings: &'a Settings,
    pub cfg: &'a WormCfg,
    pub llm: Option<&'a str>,
}

pub fn status(report: StatusReport<'_>) {
    let stats = report.catalog.stats();
    let cfg = report.cfg;
    println!("catalog:   {} ({} responses, {} categories, {} custom, {} fallbacks)",
        report.catalog_path.display(),
        stats.total_responses,
        stats.categories,
        stats.custom_triggers,
        stats.fallbacks,
    );
    println!(
        "settings:  {}",
        report
            .settings
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "defaults".into())
    );
    let transport = match (cfg.simulation_mode, cfg.serial_port.as_deref()) {
        (true, _) => "simulation (forced)".to_owned(),
        (false, Some(port)) => format!("{port} @ {} baud", cfg.baud_rate),
        (false, None) => format!("auto-detect @ {} baud", cfg.baud_rate),
    };
    println!("transport: {transport}");
    println!(
        "speech:    {}",
        cfg.speech_command.as_deref().unwrap_or("simulated")
    );
    println!(
        "voice:     {}",
        cfg.listener_command.as_deref().unwrap_or("unavailable (no listener command)")
    );
    let generative = match (cfg.use_ai_fallback, report.llm) {
        (false, _) => "disabled".to_owned(),
        (true, Some(name)) => format!("{name} (threshold {})", cfg.ai_confidence_threshold),
        (true, None) => "no provider configured".to_owned(),
    };
    println!("generative: {generative}");
    println!(
        "timing:    pulse window {:?}, poll {:?}, ceiling {:?}",
        cfg.pulse_window(),
        cfg.pulse_poll(),
        cfg.cycle_ceiling()
    );
}
