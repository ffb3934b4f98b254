/// Normalize a storage path or URL against `base_url`. Absolute URLs
/// (`http://` / `https://`) pass through untouched. A path starting with
/// `object/` (Supabase Storage's signed-URL responses omit the API prefix)
/// gets `/storage/v1` reinserted; a path already starting with
/// `storage/v1/` is just prefixed with the project base; anything else is
/// joined onto the base as-is.
pub fn normalize_url(base_url: &str, path_or_url: &str) -> String {
    let raw = path_or_url.trim();
    if raw.is_empty() {
        return raw.to_string();
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }

    let project_base = base_url.trim().trim_end_matches('/');
    if project_base.is_empty() {
        return raw.to_string();
    }
    let storage_base = format!("{project_base}/storage/v1");

    let trimmed = raw.trim_start_matches('/');
    if trimmed.starts_with("object/") {
        return format!("{storage_base}/{trimmed}");
    }
    if trimmed.starts_with("storage/v1/") {
        return format!("{project_base}/{trimmed}");
    }

    if raw.starts_with('/') {
        return format!("{project_base}{raw}");
    }
    format!("{project_base}/{raw}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_url_passes_through() {
        let url = "https://cdn.example.com/signed?token=abc";
        assert_eq!(normalize_url("https://project.supabase.co", url), url);
    }

    #[test]
    fn relative_path_is_prefixed_with_base() {
        assert_eq!(
            normalize_url("https://project.supabase.co/", "/storage/v1/object/sign/x"),
            "https://project.supabase.co/storage/v1/object/sign/x"
        );
    }

    #[test]
    fn handles_missing_and_present_slashes_consistently() {
        assert_eq!(
            normalize_url("https://project.supabase.co", "storage/v1/x"),
            normalize_url("https://project.supabase.co/", "/storage/v1/x")
        );
    }

    #[test]
    fn object_prefixed_path_reinserts_storage_v1_segment() {
        assert_eq!(
            normalize_url(
                "https://project.supabase.co",
                "/object/sign/Task_Code/x?token=y"
            ),
            "https://project.supabase.co/storage/v1/object/sign/Task_Code/x?token=y"
        );
    }
}
