//! Naming rules shared by the parser and the catalog.

/// Leading articles moved to the end of a title for sorting.
const TITLE_ARTICLES: &[&str] = &[
    "A", "The", "An", "Der", "Die", "Das", "Den", "Ein", "Eine", "Einen", "Dem", "Des", "Einem",
    "Eines", "Le", "La", "Les", "L'", "Un", "Une",
];

/// Name recorded when a package has no usable author.
pub const UNKNOWN_AUTHOR: &str = "Unknown";

/// Trim and collapse internal whitespace.
///
/// This is the key reference entities are deduplicated on (together with
/// the case-insensitive collation of the name columns).
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sort form of a title: a leading article followed by whitespace moves to
/// the end, so "The Hobbit" sorts as "Hobbit, The".
pub fn title_sort(title: &str) -> String {
    let title = title.trim();

    if let Some((first, rest)) = title.split_once(char::is_whitespace)
        && TITLE_ARTICLES.contains(&first)
    {
        let rest = rest.trim_start();
        if !rest.is_empty() {
            return format!("{}, {}", rest, first);
        }
    }

    title.to_string()
}

/// Sort form of an author name: "Walt Whitman" becomes "Whitman, Walt".
///
/// Names already containing a comma are taken as sorted. A trailing
/// generational suffix (Jr, Sr, I to IV) stays at the end:
/// "Martin Luther King Jr." becomes "King, Martin Luther Jr.".
pub fn author_sort(name: &str) -> String {
    let name = normalize_name(name);
    if name.contains(',') {
        return name;
    }

    let parts: Vec<&str> = name.split(' ').collect();
    match parts.as_slice() {
        [] | [_] => name.clone(),
        [.., last] if is_name_suffix(last) => {
            let surname = parts[parts.len() - 2];
            let given = parts[..parts.len() - 2].join(" ");
            if given.is_empty() {
                format!("{}, {}", surname, last)
            } else {
                format!("{}, {} {}", surname, given, last)
            }
        }
        [given @ .., last] => format!("{}, {}", last, given.join(" ")),
    }
}

fn is_name_suffix(token: &str) -> bool {
    let token = token.to_uppercase();
    let token = token.strip_suffix('.').unwrap_or(&token);
    matches!(token, "JR" | "SR" | "I" | "II" | "III" | "IV")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_sort_moves_articles() {
        assert_eq!(title_sort("The Hobbit"), "Hobbit, The");
        assert_eq!(title_sort("Die  Verwandlung"), "Verwandlung, Die");
        assert_eq!(title_sort("L' Étranger"), "Étranger, L'");
        assert_eq!(title_sort("Leaves of Grass"), "Leaves of Grass");
        assert_eq!(title_sort("Theory of Everything"), "Theory of Everything");
        assert_eq!(title_sort("The"), "The");
        assert_eq!(title_sort("  A Tale  "), "Tale, A");
    }

    #[test]
    fn test_author_sort() {
        assert_eq!(author_sort("Walt Whitman"), "Whitman, Walt");
        assert_eq!(author_sort("Ursula K. Le Guin"), "Guin, Ursula K. Le");
        assert_eq!(author_sort("Homer"), "Homer");
        assert_eq!(author_sort("Whitman, Walt"), "Whitman, Walt");
        assert_eq!(author_sort("Martin Luther King Jr."), "King, Martin Luther Jr.");
        assert_eq!(author_sort("King Jr"), "King, Jr");
        assert_eq!(author_sort("  Walt   Whitman "), "Whitman, Walt");
        assert_eq!(author_sort(""), "");
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Walt \t Whitman\n"), "Walt Whitman");
        assert_eq!(normalize_name("   "), "");
    }
}
