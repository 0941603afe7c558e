//! Fetching asset bytes by URL.
//!
//! Desktop builds read from the `res/` directory that `build.rs` copies into
//! `OUT_DIR`; a leading `/` is treated as the root of that directory. Web
//! builds fetch over HTTP: absolute paths resolve against the page origin,
//! relative paths against `<page>/res/`.

#[cfg(not(target_arch = "wasm32"))]
use anyhow::Context;

fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(target_arch = "wasm32")]
fn format_url(url: &str) -> anyhow::Result<reqwest::Url> {
    if is_remote(url) {
        return Ok(reqwest::Url::parse(url)?);
    }

    let window = web_sys::window().ok_or_else(|| anyhow::anyhow!("no window"))?;
    let location = window.location();
    let origin = location
        .origin()
        .map_err(|_| anyhow::anyhow!("page origin unavailable"))?;

    let base = if url.starts_with('/') {
        format!("{}/", origin)
    } else {
        let path = location.pathname().unwrap_or_else(|_| "/".to_string());
        let dir = &path[..path.rfind('/').map_or(0, |i| i + 1)];
        format!("{}{}res/", origin, dir)
    };
    Ok(reqwest::Url::parse(&base)?.join(url)?)
}

#[cfg(not(target_arch = "wasm32"))]
pub fn resolve_path(url: &str) -> std::path::PathBuf {
    std::path::Path::new(env!("OUT_DIR"))
        .join("res")
        .join(url.trim_start_matches('/'))
}

pub async fn load_string(url: &str) -> anyhow::Result<String> {
    #[cfg(target_arch = "wasm32")]
    let txt = {
        let url = format_url(url)?;
        reqwest::get(url).await?.error_for_status()?.text().await?
    };
    #[cfg(not(target_arch = "wasm32"))]
    let txt = {
        anyhow::ensure!(!is_remote(url), "remote URLs are only fetched in the browser: {url}");
        let path = resolve_path(url);
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?
    };

    Ok(txt)
}

pub async fn load_binary(url: &str) -> anyhow::Result<Vec<u8>> {
    #[cfg(target_arch = "wasm32")]
    let data = {
        let url = format_url(url)?;
        reqwest::get(url)
            .await?
            .error_for_status()?
            .bytes()
            .await?
            .to_vec()
    };
    #[cfg(not(target_arch = "wasm32"))]
    let data = {
        anyhow::ensure!(!is_remote(url), "remote URLs are only fetched in the browser: {url}");
        let path = resolve_path(url);
        std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?
    };

    Ok(data)
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    #[test]
    fn leading_slash_maps_into_res() {
        let path = resolve_path("/models/laptop.glb");
        assert!(path.ends_with("res/models/laptop.glb"));
        assert_eq!(path, resolve_path("models/laptop.glb"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = futures::executor::block_on(load_binary("/models/does-not-exist.glb")).unwrap_err();
        assert!(format!("{err:#}").contains("does-not-exist.glb"));
    }

    #[test]
    fn remote_urls_are_rejected_on_desktop() {
        assert!(futures::executor::block_on(load_string("https://example.com/a.json")).is_err());
    }
}
