/// Truncate tool output to at most `max_chars` characters, appending a
/// marker with the original and kept lengths.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let cut = output
        .char_indices()
        .nth(max_chars)
        .map_or(output.len(), |(i, _)| i);
    format!(
        "{}\n\n[truncated: {total} chars -> {max_chars} chars]",
        &output[..cut]
    )
}
