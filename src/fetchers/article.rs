//! Article lectures are delivered as an HTML fragment; wrap it in a minimal
//! document so it opens in a browser as-is.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;

use crate::download::dispatch::{ArticleFetcher, FetchJob};

pub struct ArticleWriter;

impl ArticleFetcher for ArticleWriter {
    fn fetch_article(&self, job: &FetchJob<'_>, body: &str) -> anyhow::Result<PathBuf> {
        let dest = job.dest_dir.join(format!("{}.html", job.output_stem));
        let document = format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
             <title>{}</title>\n</head>\n<body>\n{}\n</body>\n</html>\n",
            job.lecture.title, body
        );
        fs::write(&dest, document).with_context(|| format!("writing {}", dest.display()))?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::{AssetDescriptor, ContentKind, ResolvedLecture};
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn writes_wrapped_html() {
        let dir = TempDir::new().unwrap();
        let lecture = ResolvedLecture {
            id: 1,
            title: "Reading List".into(),
            asset: AssetDescriptor {
                kind: ContentKind::Article,
                ..AssetDescriptor::default()
            },
        };
        let job = FetchJob {
            lecture: &lecture,
            assets: &[],
            output_stem: "004. Reading List".into(),
            dest_dir: dir.path(),
            temp_dir: Path::new("/tmp"),
        };
        let path = ArticleWriter.fetch_article(&job, "<p>read these</p>").unwrap();
        let html = fs::read_to_string(path).unwrap();
        assert!(html.contains("<p>read these</p>"));
        assert!(html.contains("<title>Reading List</title>"));
    }
}
