//! `Cache-Control` directive parsing.

/// Parsed `Cache-Control` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub private: bool,
    pub public: bool,
}

impl CacheControl {
    pub fn parse(header: &str) -> Self {
        let mut control = Self::default();

        for directive in header.split(',') {
            let directive = directive.trim().to_ascii_lowercase();

            match directive.as_str() {
                "no-cache" => control.no_cache = true,
                "no-store" => control.no_store = true,
                "must-revalidate" => control.must_revalidate = true,
                "private" => control.private = true,
                "public" => control.public = true,
                other => {
                    if let Some(max_age) = other.strip_prefix("max-age=") {
                        control.max_age = max_age.trim_matches('"').parse().ok();
                    } else if let Some(s_maxage) = other.strip_prefix("s-maxage=") {
                        control.s_maxage = s_maxage.trim_matches('"').parse().ok();
                    }
                }
            }
        }

        control
    }

    /// Whether a response carrying this header may be written to a cache.
    pub fn is_storable(&self) -> bool {
        !self.no_store
    }
}
