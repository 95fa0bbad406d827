//! Minimal robots.txt policy: `Allow`/`Disallow` prefixes for `*` and our
//! own agent token, longest match wins.

/// Rules that apply to one user agent on one origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotsRules {
    /// `(allow, path prefix)` pairs.
    rules: Vec<(bool, String)>,
}

impl RobotsRules {
    /// No restrictions.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parse `body` for `agent`. A group naming the agent takes precedence over
    /// the `*` group.
    pub fn parse(body: &str, agent: &str) -> Self {
        let agent = agent.to_ascii_lowercase();
        let mut wildcard = Vec::new();
        let mut specific = Vec::new();
        let mut saw_specific = false;

        // Agents named by the current group; reset when a rule follows.
        let mut group_agents: Vec<String> = Vec::new();
        let mut in_rules = false;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if in_rules {
                        group_agents.clear();
                        in_rules = false;
                    }
                    group_agents.push(value.to_ascii_lowercase());
                }
                "allow" | "disallow" => {
                    in_rules = true;
                    if value.is_empty() {
                        continue;
                    }
                    let rule = (key == "allow", value.to_string());
                    if group_agents.iter().any(|a| a == "*") {
                        wildcard.push(rule.clone());
                    }
                    if group_agents.iter().any(|a| !a.is_empty() && agent.contains(a.as_str())) {
                        saw_specific = true;
                        specific.push(rule);
                    }
                }
                _ => {}
            }
        }

        Self {
            rules: if saw_specific { specific } else { wildcard },
        }
    }

    /// Whether `path` (path plus query) may be fetched.
    pub fn is_allowed(&self, path: &str) -> bool {
        self.rules
            .iter()
            .filter(|(_, prefix)| path.starts_with(prefix.as_str()))
            .max_by_key(|(allow, prefix)| (prefix.len(), *allow))
            .is_none_or(|(allow, _)| *allow)
    }
}
