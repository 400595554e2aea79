use parking_lot::RwLock;
use tracing::info;

/// Fallback names used until the dataset's neighborhood list is loaded.
const BUILTIN_NEIGHBORHOODS: &[&str] = &[
    "Astoria",
    "Bedford-Stuyvesant",
    "Boerum Hill",
    "Brooklyn Heights",
    "Bushwick",
    "Carroll Gardens",
    "Chelsea",
    "Clinton Hill",
    "Cobble Hill",
    "Crown Heights",
    "DUMBO",
    "East Village",
    "Financial District",
    "Flatiron",
    "Fort Greene",
    "Gramercy Park",
    "Greenpoint",
    "Greenwich Village",
    "Harlem",
    "Hell's Kitchen",
    "Long Island City",
    "Lower East Side",
    "Midtown",
    "Murray Hill",
    "Park Slope",
    "Prospect Heights",
    "Ridgewood",
    "SoHo",
    "Sunnyside",
    "Tribeca",
    "Upper East Side",
    "Upper West Side",
    "West Village",
    "Williamsburg",
];

/// Known neighborhood names with case-insensitive lookup and typo suggestions.
pub struct NeighborhoodDirectory {
    names: RwLock<Vec<String>>,
}

impl NeighborhoodDirectory {
    pub fn new(names: Vec<String>) -> Self {
        let directory = Self {
            names: RwLock::new(Vec::new()),
        };
        directory.replace(names);
        directory
    }

    pub fn builtin() -> Self {
        Self::new(BUILTIN_NEIGHBORHOODS.iter().map(|n| n.to_string()).collect())
    }

    /// Swap in a freshly loaded name list.
    pub fn replace(&self, mut names: Vec<String>) {
        names.retain(|n| !n.trim().is_empty());
        names.sort_by_key(|n| n.to_lowercase());
        names.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        info!("Neighborhood directory holds {} names", names.len());
        *self.names.write() = names;
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    /// Canonical spelling of `name`, if known.
    pub fn canonical(&self, name: &str) -> Option<String> {
        let wanted = normalize(name);
        self.names
            .read()
            .iter()
            .find(|n| normalize(n) == wanted)
            .cloned()
    }

    /// Longest known name mentioned in `text` on word boundaries.
    pub fn find_in(&self, text: &str) -> Option<String> {
        let haystack = format!(" {} ", normalize(text));
        self.names
            .read()
            .iter()
            .filter(|n| haystack.contains(&format!(" {} ", normalize(n))))
            .max_by_key(|n| n.len())
            .cloned()
    }

    /// Closest known names to an unrecognised one, best first.
    pub fn suggest(&self, name: &str, limit: usize) -> Vec<String> {
        let wanted = normalize(name);
        let threshold = (wanted.chars().count() / 3).max(2);

        let mut scored: Vec<(usize, String)> = self
            .names
            .read()
            .iter()
            .map(|n| (levenshtein(&wanted, &normalize(n)), n.clone()))
            .filter(|(d, _)| *d <= threshold)
            .collect();
        scored.sort();
        scored.into_iter().take(limit).map(|(_, n)| n).collect()
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Edit distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
