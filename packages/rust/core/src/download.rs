//! Guides assembled from downloadable XMLTV sources.
//!
//! A region with source URLs skips the grabber: every source is fetched
//! (gunzipped when compressed), kept in the download directory, and the
//! documents are merged into one `<tv>` guide. A failing source is skipped;
//! the region fails only when none of its sources could be fetched.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use epgsync_shared::{EpgSyncError, Region, Result, SourcesConfig, Stage, WorkspacePaths};

use crate::guide::{GuideUpdate, install_guide, partial_path, remove_if_exists};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

static TV_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<tv((?:\s[^>]*?)?)\s*(/?)>").expect("tv tag pattern compiles")
});

static GENERATOR_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s+generator-info-name\s*=\s*(?:"[^"]*"|'[^']*')"#)
        .expect("generator attribute pattern compiles")
});

/// Downloads and consolidates guide sources for a region.
#[derive(Debug, Clone)]
pub struct GuideDownloader {
    download_dir: PathBuf,
    timeout: Duration,
}

impl GuideDownloader {
    pub fn new(download_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            download_dir: download_dir.into(),
            timeout,
        }
    }

    pub fn from_config(config: &SourcesConfig, paths: &WorkspacePaths) -> Self {
        Self::new(&paths.download_dir, Duration::from_millis(config.timeout_ms))
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Fetch every source of `region`, merge them into `partial_dir` and
    /// install the result as the region's guide.
    #[instrument(skip_all, fields(region = %region.code, sources = region.sources.len()))]
    pub async fn fetch(&self, region: &Region, partial_dir: &Path) -> Result<GuideUpdate> {
        let fail =
            |msg: String| EpgSyncError::region_stage(Stage::Download, region.code.clone(), msg);

        if region.sources.is_empty() {
            return Err(fail("no sources configured".into()));
        }

        std::fs::create_dir_all(&self.download_dir)
            .map_err(|e| EpgSyncError::io(&self.download_dir, e))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("epgsync/", env!("CARGO_PKG_VERSION")))
            .timeout(self.timeout)
            .build()
            .map_err(|e| EpgSyncError::Network(format!("client build: {e}")))?;

        let mut documents = Vec::with_capacity(region.sources.len());
        for url in &region.sources {
            match self.download(&client, region, url).await {
                Ok(path) => documents.push(path),
                Err(e) => warn!(%url, error = %e, "source download failed, skipping"),
            }
        }
        if documents.is_empty() {
            return Err(fail(format!(
                "none of {} source(s) could be downloaded",
                region.sources.len()
            )));
        }

        let mut texts = Vec::with_capacity(documents.len());
        for path in &documents {
            let text =
                std::fs::read_to_string(path).map_err(|e| fail(EpgSyncError::io(path, e).to_string()))?;
            texts.push(text);
        }
        let merged = consolidate(&texts).map_err(|e| fail(e.to_string()))?;
        debug!(
            channels = merged.matches("<channel ").count(),
            programmes = merged.matches("<programme ").count(),
            "consolidated sources"
        );

        std::fs::create_dir_all(partial_dir).map_err(|e| EpgSyncError::io(partial_dir, e))?;
        let partial = partial_path(region, partial_dir);
        if let Err(e) = std::fs::write(&partial, merged) {
            remove_if_exists(&partial)?;
            return Err(EpgSyncError::io(&partial, e));
        }

        let update = install_guide(&partial, &region.output)?;
        info!(
            used = documents.len(),
            changed = update.changed,
            bytes = update.bytes,
            "guide assembled from sources"
        );
        Ok(update)
    }

    /// Download one source into the download directory, decompressed.
    async fn download(&self, client: &reqwest::Client, region: &Region, url: &str) -> Result<PathBuf> {
        debug!(%url, "downloading source");
        let response = client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| EpgSyncError::Network(format!("{url}: {e}")))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| EpgSyncError::Network(format!("{url}: {e}")))?;

        let data = decompress_if_gzip(&body)
            .map_err(|e| EpgSyncError::Network(format!("{url}: invalid gzip data: {e}")))?;

        let path = self
            .download_dir
            .join(format!("{}_{}", region.code, source_file_name(url)));
        std::fs::write(&path, data).map_err(|e| EpgSyncError::io(&path, e))?;
        Ok(path)
    }
}

/// Local file name for a source URL: the last path segment without query
/// or `.gz` suffix.
pub fn source_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(name);
    if name.is_empty() || name.contains("..") {
        "source.xml".into()
    } else {
        name.to_string()
    }
}

/// Gunzip `data` when it carries the gzip magic bytes, otherwise copy it.
pub fn decompress_if_gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    if !data.starts_with(&GZIP_MAGIC) {
        return Ok(data.to_vec());
    }
    let mut out = Vec::new();
    flate2::read::MultiGzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Merge XMLTV documents into one.
///
/// A single document is returned unchanged. Otherwise the root attributes
/// of the first document are kept (with our generator name) and the
/// channels and programmes of every document are appended in order;
/// duplicate channel ids are kept.
pub fn consolidate(documents: &[String]) -> Result<String> {
    let parts = documents
        .iter()
        .enumerate()
        .map(|(i, doc)| split_tv(doc).ok_or_else(|| {
            EpgSyncError::validation(format!("source document {} is not an XMLTV guide", i + 1))
        }))
        .collect::<Result<Vec<_>>>()?;

    match documents {
        [] => return Err(EpgSyncError::validation("no documents to consolidate")),
        [single] => return Ok(single.clone()),
        _ => {}
    }

    let attrs = GENERATOR_ATTR_RE.replace_all(parts[0].0, "");
    let mut merged = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    merged.push_str(&format!("<tv{attrs} generator-info-name=\"epgsync\">\n"));
    for (_, body) in &parts {
        let body = body.trim();
        if !body.is_empty() {
            merged.push_str(body);
            merged.push('\n');
        }
    }
    merged.push_str("</tv>\n");
    Ok(merged)
}

/// Root attributes and inner content of a `<tv>` document.
fn split_tv(doc: &str) -> Option<(&str, &str)> {
    let caps = TV_OPEN_RE.captures(doc)?;
    let open = caps.get(0)?;
    let attrs = caps.get(1).map_or("", |m| m.as_str());
    if caps.get(2).is_some_and(|m| !m.as_str().is_empty()) {
        return Some((attrs, ""));
    }
    let rest = &doc[open.end()..];
    let close = rest.rfind("</tv>")?;
    Some((attrs, &rest[..close]))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const GUIDE_A: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE tv SYSTEM "xmltv.dtd">
<tv date="20240501" generator-info-name="ripper">
  <channel id="bbc1.uk"><display-name>BBC One</display-name></channel>
  <programme start="20240501060000 +0000" channel="bbc1.uk"><title>News</title></programme>
</tv>
"#;

    const GUIDE_B: &str = r#"<tv>
  <channel id="itv.uk"><display-name>ITV</display-name></channel>
  <programme start="20240501070000 +0000" channel="itv.uk"><title>GMB</title></programme>
</tv>"#;

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("epgsync_dl_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(dir.join("output")).expect("create output dir");
        dir
    }

    fn region(dir: &Path, sources: Vec<String>) -> Region {
        Region {
            code: "UK".parse().unwrap(),
            channels: dir.join("channels").join("UK.channels.xml"),
            output: dir.join("output").join("epg_UK.xml"),
            max_connections: 1,
            timeout_ms: 60_000,
            sources,
        }
    }

    fn downloader(dir: &Path) -> GuideDownloader {
        GuideDownloader::new(dir.join("downloads"), Duration::from_secs(5))
    }

    #[test]
    fn file_names_drop_query_and_gz() {
        assert_eq!(
            source_file_name("https://h/epg/epg_ripper_UK1.xml.gz?token=1"),
            "epg_ripper_UK1.xml"
        );
        assert_eq!(source_file_name("https://h/guide.xml"), "guide.xml");
        assert_eq!(source_file_name("https://h/"), "source.xml");
    }

    #[test]
    fn gzip_is_detected_by_magic() {
        assert_eq!(decompress_if_gzip(&gzip("<tv/>")).unwrap(), b"<tv/>");
        assert_eq!(decompress_if_gzip(b"<tv/>").unwrap(), b"<tv/>");
        assert!(decompress_if_gzip(&[0x1f, 0x8b, 0x00]).is_err());
    }

    #[test]
    fn single_document_passes_through() {
        let merged = consolidate(&[GUIDE_A.to_string()]).unwrap();
        assert_eq!(merged, GUIDE_A);
    }

    #[test]
    fn documents_merge_under_first_root() {
        let merged = consolidate(&[GUIDE_A.to_string(), GUIDE_B.to_string()]).unwrap();
        assert!(merged.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"));
        assert!(merged.contains("<tv date=\"20240501\" generator-info-name=\"epgsync\">"));
        assert!(!merged.contains("ripper"));
        assert!(!merged.contains("DOCTYPE"));
        assert_eq!(merged.matches("<channel ").count(), 2);
        assert_eq!(merged.matches("<programme ").count(), 2);
        assert!(merged.find("bbc1.uk").unwrap() < merged.find("itv.uk").unwrap());
        assert!(merged.trim_end().ends_with("</tv>"));
    }

    #[test]
    fn self_closing_and_invalid_documents() {
        let merged = consolidate(&["<tv/>".to_string(), GUIDE_B.to_string()]).unwrap();
        assert_eq!(merged.matches("<channel ").count(), 1);

        let err = consolidate(&[GUIDE_A.to_string(), "<html></html>".to_string()]).unwrap_err();
        assert!(err.to_string().contains("document 2"));

        assert!(consolidate(&["<tv><channel id=\"x\"/>".to_string()]).is_err());
    }

    #[tokio::test]
    async fn fetch_merges_compressed_and_plain_sources() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/epg_ripper_UK1.xml.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(gzip(GUIDE_A)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/uk/extra.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(GUIDE_B))
            .mount(&server)
            .await;

        let dir = temp_dir();
        let region = region(
            &dir,
            vec![
                format!("{}/epg_ripper_UK1.xml.gz", server.uri()),
                format!("{}/uk/extra.xml", server.uri()),
            ],
        );
        let partials = dir.join("partial");

        let update = downloader(&dir).fetch(&region, &partials).await.unwrap();
        assert!(update.changed);

        let guide = std::fs::read_to_string(&region.output).unwrap();
        assert!(guide.contains("bbc1.uk") && guide.contains("itv.uk"));
        assert!(dir.join("downloads").join("UK_epg_ripper_UK1.xml").is_file());
        assert!(!partial_path(&region, &partials).exists());

        let again = downloader(&dir).fetch(&region, &partials).await.unwrap();
        assert!(!again.changed);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failing_source_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/epg_UK1.xml"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/epg_UK2.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(GUIDE_B))
            .mount(&server)
            .await;

        let dir = temp_dir();
        let region = region(
            &dir,
            vec![
                format!("{}/epg_UK1.xml", server.uri()),
                format!("{}/epg_UK2.xml", server.uri()),
            ],
        );

        downloader(&dir)
            .fetch(&region, &dir.join("partial"))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&region.output).unwrap(), GUIDE_B);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn all_sources_failing_keeps_previous_guide() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = temp_dir();
        let region = region(&dir, vec![format!("{}/epg_UK1.xml.gz", server.uri())]);
        std::fs::write(&region.output, "<tv>old</tv>").unwrap();

        let err = downloader(&dir)
            .fetch(&region, &dir.join("partial"))
            .await
            .unwrap_err();
        assert_eq!(err.failed_stage(), Some(Stage::Download));
        assert!(err.to_string().contains("region UK"));
        assert_eq!(std::fs::read_to_string(&region.output).unwrap(), "<tv>old</tv>");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
