/// Strips characters that cannot appear in a recording filename. Control
/// characters and the usual filesystem-reserved set are dropped, everything
/// else passes through.
pub fn sanitize_app_filename(application_name: &str) -> String {
    const INVALID: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    application_name.chars().filter(|c| *c >= ' ' && !INVALID.contains(c)).collect()
}
