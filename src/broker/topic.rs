/// Returns true when `topic` matches the MQTT subscription `filter`.
///
/// `+` matches exactly one level, a trailing `#` matches the parent level and
/// everything below it. Topics starting with `$` are only matched by filters
/// that name the `$` level explicitly.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && !filter.starts_with('$') {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
