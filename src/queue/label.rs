/// Log label for a queue: `DQM-{database}-{NN}-{tags}`.
///
/// Queue 00 is always the lead, so its implied `L` tag is left out. Negative numbers (workers
/// not yet attached to a lead) render as `00`.
#[must_use]
pub fn generate_label(database: &str, number: i32, tags: &str) -> String {
    let number = number.max(0);
    let tags: String = if number == 0 {
        tags.chars().filter(|c| *c != 'L').collect()
    } else {
        tags.to_string()
    };
    format!("DQM-{database}-{number:02}-{tags}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        assert_eq!(generate_label("acuranzo", 0, "LSMFC"), "DQM-acuranzo-00-SMFC");
        assert_eq!(generate_label("acuranzo", 3, "F"), "DQM-acuranzo-03-F");
        assert_eq!(generate_label("testdb", -1, "M"), "DQM-testdb-00-M");
        assert_eq!(generate_label("testdb", 12, "SL"), "DQM-testdb-12-SL");
    }
}
