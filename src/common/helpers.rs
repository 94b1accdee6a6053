use anyhow::Error;

/// Logs `err` with every cause on its own indented line.
pub fn print_error_chain(err: &Error) {
    error!("{}", error_chain(err));
}

fn error_chain(err: &Error) -> String {
    let mut causes = err.chain();
    let mut message = causes.next().map(|cause| cause.to_string()).unwrap_or_default();
    for cause in causes {
        message.push_str(&format!("\n       └> {}", cause));
    }
    message
}

/// `UserAccount` becomes `user_account`; runs of capitals stay together.
pub fn format_snake_case(name: &str) -> String {
    let mut formatted = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;

    for c in name.chars() {
        if !c.is_uppercase() {
            formatted.push(c);
        } else {
            if matches!(prev, Some(p) if p != '_' && !p.is_uppercase()) {
                formatted.push('_');
            }
            formatted.extend(c.to_lowercase());
        }
        prev = Some(c);
    }

    formatted
}

/// Quotes an identifier with `quote`, doubling embedded quote characters.
pub fn quote_identifier(name: &str, quote: char) -> String {
    let escaped = name.replace(quote, &format!("{}{}", quote, quote));
    format!("{}{}{}", quote, escaped, quote)
}
