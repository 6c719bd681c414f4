use regex::Regex;
use std::sync::LazyLock;

static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*(\/[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*)*$")
        .unwrap()
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

static RANGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]+-[0-9]+$").unwrap());

pub fn is_valid_name(name: &str) -> bool {
    NAME.is_match(name)
}

pub fn is_valid_tag(tag: &str) -> bool {
    TAG.is_match(tag)
}

pub fn is_valid_range(range: &str) -> bool {
    RANGE.is_match(range)
}
