//! Name policies and call/broadcast filter rules.
//!
//! The table is built once from the command line and shared read-only by
//! every connection. Rules are only ever appended: several declarations for
//! the same name compose, and a lookup takes the maximum over all of them.

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;

use crate::error::RuleError;
use crate::wire::BUS_NAME;

/// Maximum length of bus names, interfaces and members
const MAX_NAME_LEN: usize = 255;

/// Cumulative access level for a bus name or unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Policy {
    #[default]
    None,
    See,
    Talk,
    Own,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Policy::None => "none",
            Policy::See => "see",
            Policy::Talk => "talk",
            Policy::Own => "own",
        })
    }
}

bitflags! {
    /// Which traffic a filter applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FilterTypes: u8 {
        const CALL = 0x1;
        const BROADCAST = 0x2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterKind {
    /// Granted by `--see`/`--talk`/`--own`
    Blanket,
    /// Granted by a `NAME=RULE` declaration
    Rule,
}

/// One policy declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub name_is_subtree: bool,
    pub policy: Policy,
    pub types: FilterTypes,
    kind: FilterKind,
    pub path: Option<String>,
    pub path_is_subtree: bool,
    pub interface: Option<String>,
    pub member: Option<String>,
}

/// Blanket filters handed out for sticky unique-id policies, one per level.
static MATCH_ALL: [Filter; 4] = [
    Filter::match_all(Policy::None),
    Filter::match_all(Policy::See),
    Filter::match_all(Policy::Talk),
    Filter::match_all(Policy::Own),
];

/// The blanket filter granting `policy` to everything.
pub fn match_all(policy: Policy) -> &'static Filter {
    &MATCH_ALL[policy as usize]
}

impl Filter {
    const fn match_all(policy: Policy) -> Self {
        Self {
            name: String::new(),
            name_is_subtree: false,
            policy,
            types: FilterTypes::all(),
            kind: FilterKind::Blanket,
            path: None,
            path_is_subtree: false,
            interface: None,
            member: None,
        }
    }

    fn blanket(name: &str, name_is_subtree: bool, policy: Policy) -> Self {
        Self {
            name: name.to_owned(),
            name_is_subtree,
            ..Self::match_all(policy)
        }
    }

    /// Parse `[*|INTERFACE.*|INTERFACE.MEMBER][@/PATH[/*]]`.
    fn rule(name: &str, name_is_subtree: bool, types: FilterTypes, rule: &str) -> Result<Self, RuleError> {
        let mut filter = Self {
            name: name.to_owned(),
            name_is_subtree,
            policy: Policy::Talk,
            types,
            kind: FilterKind::Rule,
            path: None,
            path_is_subtree: false,
            interface: None,
            member: None,
        };

        let (method, path) = match rule.split_once('@') {
            Some((method, path)) => (method, Some(path)),
            None => (rule, None),
        };

        if let Some(path) = path {
            let (path, subtree) = match path.strip_suffix("/*") {
                Some("") => ("/", true),
                Some(prefix) => (prefix, true),
                None => (path, false),
            };
            if !is_valid_object_path(path) {
                return Err(RuleError::InvalidPath(path.to_owned()));
            }
            filter.path = Some(path.to_owned());
            filter.path_is_subtree = subtree;
        }

        if !method.is_empty() && method != "*" {
            let Some((interface, member)) = method.rsplit_once('.') else {
                return Err(RuleError::InvalidMember(method.to_owned()));
            };
            if !is_valid_interface(interface) {
                return Err(RuleError::InvalidMember(method.to_owned()));
            }
            filter.interface = Some(interface.to_owned());
            if member != "*" {
                if !is_valid_member(member) {
                    return Err(RuleError::InvalidMember(method.to_owned()));
                }
                filter.member = Some(member.to_owned());
            }
        }

        Ok(filter)
    }

    #[inline]
    pub fn is_rule(&self) -> bool {
        self.kind == FilterKind::Rule
    }

    fn matches(&self, path: Option<&str>, interface: Option<&str>, member: Option<&str>) -> bool {
        if let Some(filter_path) = &self.path {
            let Some(path) = path else {
                return false;
            };
            if self.path_is_subtree {
                let prefix = filter_path.trim_end_matches('/');
                match path.strip_prefix(prefix) {
                    Some(rest) if rest.is_empty() || rest.starts_with('/') => {}
                    _ => return false,
                }
            } else if filter_path != path {
                return false;
            }
        }
        if self.interface.is_some() && self.interface.as_deref() != interface {
            return false;
        }
        if self.member.is_some() && self.member.as_deref() != member {
            return false;
        }
        true
    }
}

/// Whether any of `filters` lets a message of type `ty` through.
///
/// Only filters granting at least TALK for `ty` take part. When one of them
/// is a detailed rule, a detailed rule must match; blanket grants no longer
/// suffice for that type.
pub fn any_filter_matches(
    filters: &[&Filter],
    ty: FilterTypes,
    path: Option<&str>,
    interface: Option<&str>,
    member: Option<&str>,
) -> bool {
    let candidates: Vec<&Filter> = filters
        .iter()
        .copied()
        .filter(|f| f.policy >= Policy::Talk && f.types.intersects(ty))
        .collect();
    let has_rules = candidates.iter().any(|f| f.is_rule());
    candidates
        .iter()
        .filter(|f| !has_rules || f.is_rule())
        .any(|f| f.matches(path, interface, member))
}

// =============================================================================
// Policy Table
// =============================================================================

#[derive(Debug, Clone)]
pub struct PolicyTable {
    /// Filters keyed by name (without the `.*` of subtree declarations)
    filters: BTreeMap<String, Vec<Filter>>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyTable {
    /// A table where only the bus driver itself can be talked to.
    pub fn new() -> Self {
        let mut table = Self {
            filters: BTreeMap::new(),
        };
        table.add_policy(BUS_NAME, false, Policy::Talk);
        table
    }

    fn push(&mut self, filter: Filter) {
        log::debug!(
            "[POLICY] {}{} -> {} ({:?}{}{}{})",
            filter.name,
            if filter.name_is_subtree { ".*" } else { "" },
            filter.policy,
            filter.types,
            filter.interface.as_deref().map(|i| format!(" iface={}", i)).unwrap_or_default(),
            filter.member.as_deref().map(|m| format!(" member={}", m)).unwrap_or_default(),
            filter.path.as_deref().map(|p| format!(" path={}", p)).unwrap_or_default(),
        );
        self.filters.entry(filter.name.clone()).or_default().push(filter);
    }

    pub fn add_policy(&mut self, name: &str, name_is_subtree: bool, policy: Policy) {
        self.push(Filter::blanket(name, name_is_subtree, policy));
    }

    pub fn add_rule(
        &mut self,
        name: &str,
        name_is_subtree: bool,
        types: FilterTypes,
        rule: &str,
    ) -> Result<(), RuleError> {
        let filter = Filter::rule(name, name_is_subtree, types, rule)?;
        self.push(filter);
        Ok(())
    }

    pub fn add_call_rule(&mut self, name: &str, name_is_subtree: bool, rule: &str) -> Result<(), RuleError> {
        self.add_rule(name, name_is_subtree, FilterTypes::CALL, rule)
    }

    pub fn add_broadcast_rule(&mut self, name: &str, name_is_subtree: bool, rule: &str) -> Result<(), RuleError> {
        self.add_rule(name, name_is_subtree, FilterTypes::BROADCAST, rule)
    }

    /// Effective policy for a well-known name and every filter contributing
    /// to it: exact declarations, plus subtree declarations on the name itself
    /// and on each dot-bounded prefix.
    pub fn max_policy_and_matched(&self, name: &str) -> (Policy, Vec<&Filter>) {
        let mut policy = Policy::None;
        let mut matched = Vec::new();

        for filter in self.filters.get(name).into_iter().flatten() {
            policy = policy.max(filter.policy);
            matched.push(filter);
        }

        let mut prefix = name;
        while let Some(dot) = prefix.rfind('.') {
            prefix = &prefix[..dot];
            for filter in self.filters.get(prefix).into_iter().flatten() {
                if filter.name_is_subtree {
                    policy = policy.max(filter.policy);
                    matched.push(filter);
                }
            }
        }

        (policy, matched)
    }

    pub fn max_policy(&self, name: &str) -> Policy {
        self.max_policy_and_matched(name).0
    }

    /// Policy granted to `name` by subtree declarations alone.
    pub fn wildcard_policy(&self, name: &str) -> Policy {
        let mut policy = Policy::None;
        let mut prefix = Some(name);
        while let Some(current) = prefix {
            for filter in self.filters.get(current).into_iter().flatten() {
                if filter.name_is_subtree {
                    policy = policy.max(filter.policy);
                }
            }
            prefix = current.rfind('.').map(|dot| &current[..dot]);
        }
        policy
    }

    /// Every declared name, with whether any declaration for it is a subtree.
    pub fn names(&self) -> impl Iterator<Item = (&str, bool)> {
        self.filters.iter().map(|(name, filters)| {
            (name.as_str(), filters.iter().any(|f| f.name_is_subtree))
        })
    }
}

// =============================================================================
// Declaration Parsing
// =============================================================================

/// Split `NAME` or `NAME.*` into the name and its subtree flag.
pub fn parse_name(arg: &str) -> Result<(String, bool), RuleError> {
    let (name, subtree) = match arg.strip_suffix(".*") {
        Some(name) => (name, true),
        None => (arg, false),
    };
    if !is_valid_bus_name(name) {
        return Err(RuleError::InvalidName(arg.to_owned()));
    }
    Ok((name.to_owned(), subtree))
}

/// Split `NAME=RULE` into the name, its subtree flag and the rule.
pub fn parse_name_rule(arg: &str) -> Result<(String, bool, &str), RuleError> {
    let (name, rule) = arg
        .split_once('=')
        .ok_or_else(|| RuleError::MissingRule(arg.to_owned()))?;
    let (name, subtree) = parse_name(name)?;
    Ok((name, subtree, rule))
}

fn is_name_element(element: &str, extra: &[u8]) -> bool {
    let bytes = element.as_bytes();
    !bytes.is_empty()
        && !bytes[0].is_ascii_digit()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || extra.contains(b))
}

/// Well-known bus name: two or more dot-separated elements, no unique names.
pub fn is_valid_bus_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN
        && !name.starts_with(':')
        && name.split('.').count() >= 2
        && name.split('.').all(|e| is_name_element(e, b"-"))
}

pub fn is_valid_interface(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN
        && name.split('.').count() >= 2
        && name.split('.').all(|e| is_name_element(e, b""))
}

pub fn is_valid_member(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN && is_name_element(name, b"")
}

pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|e| {
        !e.is_empty() && e.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_ordering() {
        assert!(Policy::None < Policy::See);
        assert!(Policy::See < Policy::Talk);
        assert!(Policy::Talk < Policy::Own);
    }

    #[test]
    fn test_bus_is_always_talk() {
        let table = PolicyTable::new();
        assert_eq!(table.max_policy(BUS_NAME), Policy::Talk);
        assert_eq!(table.max_policy("org.example.Other"), Policy::None);
    }

    #[test]
    fn test_max_over_exact_and_subtree_matches() {
        let mut table = PolicyTable::new();
        table.add_policy("org.example", true, Policy::See);
        table.add_policy("org.example.App", false, Policy::Talk);
        table.add_policy("org.example.App", true, Policy::Own);
        table.add_policy("org", true, Policy::See);

        let (policy, matched) = table.max_policy_and_matched("org.example.App");
        assert_eq!(policy, Policy::Own);
        assert_eq!(matched.len(), 4);

        assert_eq!(table.max_policy("org.example.App.Sub"), Policy::Own);
        assert_eq!(table.max_policy("org.example.Other"), Policy::See);
        assert_eq!(table.max_policy("org.example"), Policy::See);
        // Prefix matching is dot-bounded
        assert_eq!(table.max_policy("org.exampleX.App"), Policy::See);
        assert_eq!(table.max_policy("com.example.App"), Policy::None);
    }

    #[test]
    fn test_exact_policy_does_not_cover_children() {
        let mut table = PolicyTable::new();
        table.add_policy("org.example.App", false, Policy::Own);
        assert_eq!(table.max_policy("org.example.App.Child"), Policy::None);
        assert_eq!(table.wildcard_policy("org.example.App"), Policy::None);

        table.add_policy("org.example", true, Policy::Talk);
        assert_eq!(table.wildcard_policy("org.example.App.Child"), Policy::Talk);
        assert_eq!(table.wildcard_policy("org.example"), Policy::Talk);
    }

    #[test]
    fn test_rules_compose_instead_of_replacing() {
        let mut table = PolicyTable::new();
        table.add_call_rule("org.example.App", false, "org.example.Iface.A").unwrap();
        table.add_call_rule("org.example.App", false, "org.example.Iface.B").unwrap();
        let (policy, matched) = table.max_policy_and_matched("org.example.App");
        assert_eq!(policy, Policy::Talk);
        assert_eq!(matched.len(), 2);
        let a = any_filter_matches(&matched, FilterTypes::CALL, Some("/"), Some("org.example.Iface"), Some("A"));
        let b = any_filter_matches(&matched, FilterTypes::CALL, Some("/"), Some("org.example.Iface"), Some("B"));
        let c = any_filter_matches(&matched, FilterTypes::CALL, Some("/"), Some("org.example.Iface"), Some("C"));
        assert!(a && b && !c);
    }

    #[test]
    fn test_rule_parsing() {
        let f = Filter::rule("org.a.B", false, FilterTypes::CALL, "org.a.Iface.Method@/org/a/*").unwrap();
        assert_eq!(f.interface.as_deref(), Some("org.a.Iface"));
        assert_eq!(f.member.as_deref(), Some("Method"));
        assert_eq!(f.path.as_deref(), Some("/org/a"));
        assert!(f.path_is_subtree);

        let f = Filter::rule("org.a.B", false, FilterTypes::CALL, "org.a.Iface.*").unwrap();
        assert_eq!(f.interface.as_deref(), Some("org.a.Iface"));
        assert_eq!(f.member, None);
        assert_eq!(f.path, None);

        let f = Filter::rule("org.a.B", false, FilterTypes::CALL, "*@/").unwrap();
        assert_eq!(f.interface, None);
        assert_eq!(f.path.as_deref(), Some("/"));
        assert!(!f.path_is_subtree);

        let f = Filter::rule("org.a.B", false, FilterTypes::CALL, "@/*").unwrap();
        assert_eq!(f.path.as_deref(), Some("/"));
        assert!(f.path_is_subtree);

        assert!(Filter::rule("org.a.B", false, FilterTypes::CALL, "Method").is_err());
        assert!(Filter::rule("org.a.B", false, FilterTypes::CALL, "*@relative").is_err());
        assert!(Filter::rule("org.a.B", false, FilterTypes::CALL, "org.a.I.1bad").is_err());
    }

    #[test]
    fn test_path_matching() {
        let f = Filter::rule("org.a.B", false, FilterTypes::CALL, "*@/org/a/*").unwrap();
        assert!(f.matches(Some("/org/a"), None, None));
        assert!(f.matches(Some("/org/a/b/c"), None, None));
        assert!(!f.matches(Some("/org/ab"), None, None));
        assert!(!f.matches(None, None, None));

        let f = Filter::rule("org.a.B", false, FilterTypes::CALL, "*@/*").unwrap();
        assert!(f.matches(Some("/anything/at/all"), None, None));

        let f = Filter::rule("org.a.B", false, FilterTypes::CALL, "*@/org/a").unwrap();
        assert!(f.matches(Some("/org/a"), None, None));
        assert!(!f.matches(Some("/org/a/b"), None, None));
    }

    #[test]
    fn test_detailed_rule_takes_precedence_over_blanket_talk() {
        let mut table = PolicyTable::new();
        table.add_policy("org.example.App", false, Policy::Talk);
        let (_, matched) = table.max_policy_and_matched("org.example.App");
        assert!(any_filter_matches(&matched, FilterTypes::CALL, Some("/"), None, Some("Anything")));

        table.add_call_rule("org.example.App", false, "org.example.Iface.Allowed").unwrap();
        let (_, matched) = table.max_policy_and_matched("org.example.App");
        assert!(!any_filter_matches(&matched, FilterTypes::CALL, Some("/"), Some("org.example.Iface"), Some("Other")));
        assert!(any_filter_matches(&matched, FilterTypes::CALL, Some("/"), Some("org.example.Iface"), Some("Allowed")));
        // Broadcasts have no detailed rule, so the blanket grant still applies
        assert!(any_filter_matches(&matched, FilterTypes::BROADCAST, Some("/"), Some("x.y"), Some("Sig")));
    }

    #[test]
    fn test_rule_types_are_respected() {
        let mut table = PolicyTable::new();
        table.add_broadcast_rule("org.example.App", false, "org.example.Iface.Changed").unwrap();
        let (policy, matched) = table.max_policy_and_matched("org.example.App");
        assert_eq!(policy, Policy::Talk);
        assert!(!any_filter_matches(&matched, FilterTypes::CALL, Some("/"), Some("org.example.Iface"), Some("Changed")));
        assert!(any_filter_matches(&matched, FilterTypes::BROADCAST, Some("/"), Some("org.example.Iface"), Some("Changed")));
    }

    #[test]
    fn test_see_filters_never_match_calls() {
        let mut table = PolicyTable::new();
        table.add_policy("org.example.App", false, Policy::See);
        let (_, matched) = table.max_policy_and_matched("org.example.App");
        assert!(!any_filter_matches(&matched, FilterTypes::CALL, Some("/"), None, Some("M")));
        assert!(any_filter_matches(&[match_all(Policy::Talk)], FilterTypes::CALL, None, None, None));
        assert!(!any_filter_matches(&[match_all(Policy::See)], FilterTypes::CALL, None, None, None));
    }

    #[test]
    fn test_parse_declarations() {
        assert_eq!(parse_name("org.example.App"), Ok(("org.example.App".into(), false)));
        assert_eq!(parse_name("org.example.*"), Ok(("org.example".into(), true)));
        assert!(parse_name("org.*").is_err());
        assert!(parse_name(":1.5").is_err());
        assert!(parse_name("org..x").is_err());
        assert!(parse_name("org.1x").is_err());

        let (name, subtree, rule) = parse_name_rule("org.example.App=org.example.Iface.*@/a").unwrap();
        assert_eq!((name.as_str(), subtree, rule), ("org.example.App", false, "org.example.Iface.*@/a"));
        assert!(parse_name_rule("org.example.App").is_err());
    }

    #[test]
    fn test_names_reports_subtree() {
        let mut table = PolicyTable::new();
        table.add_policy("org.example", true, Policy::See);
        table.add_policy("com.example.App", false, Policy::Talk);
        let names: Vec<_> = table.names().collect();
        assert_eq!(
            names,
            vec![("com.example.App", false), ("org.example", true), (BUS_NAME, false)]
        );
    }
}
