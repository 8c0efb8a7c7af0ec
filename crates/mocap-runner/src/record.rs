/// Split one delimited line into fields. Double-quoted fields may contain
/// the delimiter; `""` inside quotes is a literal quote.
pub fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.is_empty() => in_quotes = true,
            c if c == delimiter && !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_and_quoted_fields() {
        assert_eq!(split_fields("a,b,,c\r\n", ','), vec!["a", "b", "", "c"]);
        assert_eq!(
            split_fields(r#"set_phase;"x;y";"say ""hi""""#, ';'),
            vec!["set_phase", "x;y", r#"say "hi""#]
        );
        assert_eq!(split_fields("", ','), vec![""]);
    }
}
