//! Platform matrix planner.

use kiln_core::job::BuildDefinition;
use kiln_core::{CacheRef, Error, Platform, PlatformJob, Result, RunId, SourceSet, TagPlan};
use std::collections::HashSet;
use std::sync::Arc;

/// Parse requested platform identifiers, keeping their order.
///
/// An empty list, an unparsable entry or a repeated platform is a configuration error.
pub fn parse_platforms(requested: &[String]) -> Result<Vec<Platform>> {
    if requested.is_empty() {
        return Err(Error::Configuration(
            "no target platforms requested".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    let mut platforms = Vec::with_capacity(requested.len());
    for raw in requested {
        let platform = Platform::parse(raw)
            .map_err(|e| Error::Configuration(format!("invalid platform '{}': {}", raw, e)))?;
        if !seen.insert(platform.clone()) {
            return Err(Error::Configuration(format!(
                "platform '{}' is requested more than once",
                platform
            )));
        }
        platforms.push(platform);
    }
    Ok(platforms)
}

/// Expand the requested platforms into one job each, in request order.
pub fn plan_jobs(
    run_id: RunId,
    requested: &[String],
    sources: Arc<SourceSet>,
    tags: Arc<TagPlan>,
    cache: &CacheRef,
    build: Arc<BuildDefinition>,
) -> Result<Vec<PlatformJob>> {
    let jobs = parse_platforms(requested)?
        .into_iter()
        .enumerate()
        .map(|(index, platform)| PlatformJob {
            run_id,
            index,
            platform,
            sources: sources.clone(),
            tags: tags.clone(),
            cache: cache.clone(),
            build: build.clone(),
        })
        .collect();
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiln_core::tags::{TagInputs, derive_tag_plan};
    use kiln_core::{BuildRequest, CacheMode, Trigger};

    fn plan(platforms: &[&str]) -> Result<Vec<PlatformJob>> {
        let requested: Vec<String> = platforms.iter().map(|p| p.to_string()).collect();
        let request = BuildRequest::new(
            Trigger::from_ref("refs/heads/main").unwrap(),
            "abc1234",
            requested.clone(),
        )
        .unwrap();
        let tags = derive_tag_plan(
            &request,
            &TagInputs {
                image: Some("ghcr.io/example/atlas"),
                source_url: None,
                title: None,
                created: Utc::now(),
            },
        )
        .unwrap();

        plan_jobs(
            RunId::new(),
            request.platforms(),
            Arc::new(SourceSet::new()),
            Arc::new(tags),
            &CacheRef {
                read_scope: "ghcr.io/example/atlas:buildcache".to_string(),
                write_scope: "ghcr.io/example/atlas:buildcache".to_string(),
                mode: CacheMode::Max,
            },
            Arc::new(BuildDefinition::default()),
        )
    }

    #[test]
    fn test_one_job_per_platform_in_order() {
        let jobs = plan(&["linux/arm64", "linux/amd64", "linux/arm/v7"]).unwrap();
        let platforms: Vec<String> = jobs.iter().map(|j| j.platform.to_string()).collect();
        assert_eq!(platforms, ["linux/arm64", "linux/amd64", "linux/arm/v7"]);
        assert_eq!(
            jobs.iter().map(|j| j.index).collect::<Vec<_>>(),
            [0, 1, 2]
        );
        assert!(jobs.iter().all(|j| j.run_id == jobs[0].run_id));
    }

    #[test]
    fn test_empty_platform_list() {
        assert!(matches!(plan(&[]), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_invalid_and_duplicate_platforms() {
        assert!(matches!(plan(&["linux/amd64/v2/extra"]), Err(Error::Configuration(_))));
        assert!(matches!(
            plan(&["linux/amd64", "linux/x86_64"]),
            Err(Error::Configuration(_))
        ));
    }
}
