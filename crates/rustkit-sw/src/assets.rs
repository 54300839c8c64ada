//! Seeding a new storage with the application's bundled assets.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::error::{CacheError, CacheResult};
use crate::record::{Headers, RequestDescriptor, ResponseRecord};
use crate::storage::CacheStorage;

/// Store every file under `assets_dir` in the cache `cache_name`.
///
/// Each file becomes a GET entry at `base_url` + its relative path, with a
/// 200 response whose `Content-Type` is guessed from the extension. The batch
/// is written in one transaction. Returns the number of entries stored.
pub(crate) async fn seed_bundled_assets(
    storage: &Arc<CacheStorage>,
    assets_dir: &Path,
    base_url: &Url,
    cache_name: &str,
) -> CacheResult<usize> {
    let mut files = Vec::new();
    collect_files(assets_dir, &mut files)?;
    files.sort();

    let mut pairs = Vec::with_capacity(files.len());
    for path in files {
        let relative = path
            .strip_prefix(assets_dir)
            .map_err(|e| CacheError::capture(e.to_string()))?;
        let url = asset_url(base_url, relative)?;
        let body = std::fs::read(&path)
            .map_err(|e| CacheError::capture(format!("{}: {}", path.display(), e)))?;

        let mime = mime_guess::from_path(&path).first_or_octet_stream();
        let mut headers = Headers::new();
        headers.append("Content-Type", mime.essence_str());
        headers.append("Content-Length", body.len().to_string());

        debug!(url = %url, bytes = body.len(), "Seeding asset");
        let response = ResponseRecord::new(200, headers, body).with_url(url.clone());
        pairs.push((RequestDescriptor::get(url), response));
    }

    let count = pairs.len();
    let cache = storage.open(cache_name).await?;
    storage.cache_put_all(cache.name(), pairs).await?;

    info!(scope = %storage.scope(), cache = cache_name, count, "Seeded bundled assets");
    Ok(count)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> CacheResult<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| CacheError::capture(format!("{}: {}", dir.display(), e)))?;
    for entry in entries {
        let path = entry
            .map_err(|e| CacheError::capture(format!("{}: {}", dir.display(), e)))?
            .path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn asset_url(base_url: &Url, relative: &Path) -> CacheResult<Url> {
    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| CacheError::Config(format!("base_url {base_url} cannot be a base")))?
        .pop_if_empty()
        .extend(&segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::MatchOptions;
    use tempfile::tempdir;

    #[test]
    fn test_asset_url() {
        let base = Url::parse("https://localhost/app/").unwrap();
        let url = asset_url(&base, Path::new("css/site main.css")).unwrap();
        assert_eq!(url.as_str(), "https://localhost/app/css/site%20main.css");
    }

    #[tokio::test]
    async fn test_seed_bundled_assets() {
        let dir = tempdir().unwrap();
        let assets = dir.path().join("www");
        std::fs::create_dir_all(assets.join("js")).unwrap();
        std::fs::write(assets.join("index.html"), "<html></html>").unwrap();
        std::fs::write(assets.join("js").join("app.js"), "run()").unwrap();

        let scope = Url::parse("https://localhost/").unwrap();
        let (storage, _) =
            CacheStorage::open_at(scope.clone(), &dir.path().join("storage.sqlite")).unwrap();
        let storage = Arc::new(storage);

        let count = seed_bundled_assets(&storage, &assets, &scope, "bundled-assets")
            .await
            .unwrap();
        assert_eq!(count, 2);

        let hit = storage
            .match_request(
                &RequestDescriptor::parse("GET", "https://localhost/js/app.js").unwrap(),
                &MatchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(&hit.body()[..], b"run()");

        let page = storage
            .match_request(
                &RequestDescriptor::parse("GET", "https://localhost/index.html").unwrap(),
                &MatchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.headers().get("content-type"), Some("text/html"));
    }
}
