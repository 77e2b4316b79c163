use std::collections::HashMap;
use std::time::Duration;

/// Bindings available to a query template (spec §4.2): `UUIDs` (pipe-joined
/// unit UUIDs), `ScrapeInterval`, `EvaluationInterval`, `RateInterval`,
/// `Range` (window duration), plus their millisecond forms.
pub struct TemplateBindings {
    pub uuids: Vec<String>,
    pub scrape_interval: Duration,
    pub evaluation_interval: Duration,
    pub rate_interval: Duration,
    pub range: Duration,
}

impl TemplateBindings {
    fn as_map(&self) -> HashMap<&'static str, String> {
        let mut m = HashMap::new();
        m.insert("UUIDs", self.uuids.join("|"));
        m.insert("ScrapeInterval", humantime::format_duration(self.scrape_interval).to_string());
        m.insert(
            "ScrapeIntervalMilliseconds",
            self.scrape_interval.as_millis().to_string(),
        );
        m.insert(
            "EvaluationInterval",
            humantime::format_duration(self.evaluation_interval).to_string(),
        );
        m.insert(
            "EvaluationIntervalMilliseconds",
            self.evaluation_interval.as_millis().to_string(),
        );
        m.insert("RateInterval", humantime::format_duration(self.rate_interval).to_string());
        m.insert("RateIntervalMilliseconds", self.rate_interval.as_millis().to_string());
        m.insert("Range", humantime::format_duration(self.range).to_string());
        m.insert("RangeMilliseconds", self.range.as_millis().to_string());
        m
    }

    /// Expand `{{Var}}` placeholders in `template` with these bindings.
    pub fn render(&self, template: &str) -> String {
        let bindings = self.as_map();
        let mut out = template.to_string();
        for (key, value) in bindings {
            out = out.replace(&format!("{{{{{key}}}}}"), &value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_uuids_pipe_joined() {
        let b = TemplateBindings {
            uuids: vec!["a".into(), "b".into()],
            scrape_interval: Duration::from_secs(15),
            evaluation_interval: Duration::from_secs(15),
            rate_interval: Duration::from_secs(60),
            range: Duration::from_secs(900),
        };
        let rendered = b.render(r#"avg_cpu_usage{uuid=~"{{UUIDs}}"}[{{Range}}]"#);
        assert_eq!(rendered, r#"avg_cpu_usage{uuid=~"a|b"}[15m]"#);
    }
}
