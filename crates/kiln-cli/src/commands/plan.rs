//! Dry planning: trigger match, tags, labels and jobs without touching the network.

use anyhow::Result;
use chrono::Utc;
use kiln_config::VariableContext;
use kiln_core::tags::{TagInputs, derive_tag_plan};
use kiln_core::{Platform, RunId};
use kiln_scheduler::parse_platforms;
use std::path::Path;

use crate::TriggerArgs;

pub fn plan(path: &Path, args: &TriggerArgs) -> Result<()> {
    let pipeline = super::load(path)?;
    let Some(request) = super::build_request(&pipeline, args)? else {
        return Ok(());
    };

    let now = Utc::now();
    let tags = derive_tag_plan(
        &request,
        &TagInputs {
            image: Some(pipeline.image.as_str()),
            source_url: Some(pipeline.source.trim_end_matches(".git")),
            title: pipeline.title.as_deref(),
            created: now,
        },
    )?;
    let platforms = parse_platforms(request.platforms())?;

    let vars = VariableContext::for_run(
        &request,
        &pipeline.name,
        pipeline.image.as_str(),
        RunId::new(),
        now,
    );
    let build = pipeline.build_definition(&vars);
    let cache = pipeline.cache_ref();
    let host = Platform::host();

    println!("Pipeline: {}", pipeline.name);
    if let Some(rule) = pipeline.matching_rule(request.trigger()) {
        println!("Trigger:  {} matched {}", request.trigger().full_ref(), rule);
    } else {
        println!("Trigger:  {} (no rules, every push builds)", request.trigger().full_ref());
    }
    println!("Commit:   {}", request.commit_sha());

    println!("\nTags:");
    for reference in tags.references() {
        println!("  {}", reference);
    }

    println!("\nLabels:");
    for (key, value) in tags.labels() {
        println!("  {}={}", key, value);
    }

    println!("\nBuild args:");
    for (key, value) in build.public_args() {
        let marker = if build.volatile_args.contains(&key) {
            " (volatile)"
        } else {
            ""
        };
        println!("  {}={}{}", key, value, marker);
    }

    println!("\nJobs (host {}):", host);
    for (index, platform) in platforms.iter().enumerate() {
        let emulation = if platform.needs_emulation_on(&host) {
            "emulated"
        } else {
            "native"
        };
        println!("  {}. {} [{}]", index + 1, platform, emulation);
    }

    println!("\nCache:");
    println!("  read:  {}", cache.read_scope);
    println!("  write: {} (mode={})", cache.write_scope, cache.mode);
    println!(
        "\nPush:     {}",
        if pipeline.push { "enabled" } else { "disabled" }
    );

    Ok(())
}
