use std::path::Path;

use anyhow::bail;
use indoc::formatdoc;

use crate::{Config, RateLimitConfig, StorageConfig};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref().to_path_buf();
    let content = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&content)?;

    let warnings = validate_rate_limits(&config.server.rate_limits)?;

    for warning in warnings {
        log::warn!("{warning}");
    }

    Ok(config)
}

/// Validates the rate limit configuration and returns warnings.
pub(crate) fn validate_rate_limits(config: &RateLimitConfig) -> anyhow::Result<Vec<String>> {
    let mut warnings = Vec::new();

    if config.duration.as_secs() == 0 {
        bail!("Rate limit duration must be at least one second, got {:?}", config.duration);
    }

    if config.duration.subsec_nanos() != 0 {
        bail!(
            "Rate limit duration must be a whole number of seconds, got {:?}",
            config.duration
        );
    }

    if let StorageConfig::Redis(redis) = &config.storage
        && !(redis.url.starts_with("redis://") || redis.url.starts_with("rediss://"))
    {
        bail!(formatdoc! {r#"
            Invalid Redis URL '{}' in [server.rate_limits.storage].
            The URL must start with redis:// or rediss:// (TLS), for example:

            [server.rate_limits.storage]
            type = "redis"
            url = "redis://localhost:6379/0"
        "#, redis.url});
    }

    for (scope, rules) in [("group", &config.groups), ("user", &config.users)] {
        for (key, [total, success]) in rules {
            if *success < 1 {
                bail!("{scope} {key} has invalid rate limit values: [{total}, {success}], success limit must be >= 1");
            }
        }
    }

    if !config.enabled {
        return Ok(warnings);
    }

    let no_ceilings = config.total_limit == 0
        && config.global_limit == 0
        && config.groups.is_empty()
        && config.users.is_empty()
        && config.models.values().all(|[total, _]| *total == 0)
        && config.global_models.values().all(|limit| *limit == 0);

    if no_ceilings {
        warnings.push(format!(
            "Rate limiting is enabled but only the default success limit of {} per {:?} applies",
            config.success_limit, config.duration
        ));
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use indoc::indoc;
    use insta::{assert_debug_snapshot, assert_snapshot};

    use crate::Config;

    fn validate(config: &str) -> anyhow::Result<Vec<String>> {
        let config: Config = toml::from_str(config).unwrap();
        super::validate_rate_limits(&config.server.rate_limits)
    }

    #[test]
    fn disabled_defaults_are_valid() {
        let warnings = validate("").unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn enabled_without_ceilings_warns() {
        let warnings = validate(indoc! {r#"
            [server.rate_limits]
            enabled = true
        "#})
        .unwrap();

        assert_debug_snapshot!(warnings, @r#"
        [
            "Rate limiting is enabled but only the default success limit of 1000 per 60s applies",
        ]
        "#);
    }

    #[test]
    fn enabled_with_global_limit_does_not_warn() {
        let warnings = validate(indoc! {r#"
            [server.rate_limits]
            enabled = true
            global_limit = 5
        "#})
        .unwrap();

        assert!(warnings.is_empty());
    }

    #[test]
    fn sub_second_duration_fails() {
        let error = validate(indoc! {r#"
            [server.rate_limits]
            enabled = true
            duration = "500ms"
        "#})
        .unwrap_err();

        assert_snapshot!(error.to_string(), @"Rate limit duration must be at least one second, got 500ms");
    }

    #[test]
    fn fractional_duration_fails() {
        let error = validate(indoc! {r#"
            [server.rate_limits]
            duration = "1500ms"
        "#})
        .unwrap_err();

        assert_snapshot!(error.to_string(), @"Rate limit duration must be a whole number of seconds, got 1.5s");
    }

    #[test]
    fn group_without_success_limit_fails() {
        let error = validate(indoc! {r#"
            [server.rate_limits]
            groups = { vip = [10, 0] }
        "#})
        .unwrap_err();

        assert_snapshot!(error.to_string(), @"group vip has invalid rate limit values: [10, 0], success limit must be >= 1");
    }

    #[test]
    fn invalid_redis_url_fails() {
        let error = validate(indoc! {r#"
            [server.rate_limits.storage]
            type = "redis"
            url = "http://localhost:6379"
        "#})
        .unwrap_err();

        assert!(error.to_string().starts_with("Invalid Redis URL 'http://localhost:6379'"));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();

        file.write_all(
            indoc! {r#"
                [server.rate_limits]
                enabled = true
                users = { "u1" = [5, 5] }
            "#}
            .as_bytes(),
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();

        assert!(config.server.rate_limits.enabled);
        assert_eq!(config.server.rate_limits.users["u1"], [5, 5]);
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(Config::load("/nonexistent/gateway.toml").is_err());
    }
}
