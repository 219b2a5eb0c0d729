use crate::models::{Book, BookMetadata, Chapter, Resource, SummarizedChapter};
use crate::services::markup;
use anyhow::{Context, Result, anyhow, bail};
use epub_builder::{EpubBuilder, EpubContent, ReferenceType, ZipLibrary};
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::OnceLock;

const XHTML: &str = "application/xhtml+xml";

struct OpfPatterns {
    rootfile: Regex,
    item: Regex,
    itemref: Regex,
    attr: Regex,
    dc: Regex,
}

fn opf_patterns() -> &'static OpfPatterns {
    static PATTERNS: OnceLock<OpfPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| OpfPatterns {
        rootfile: Regex::new(r#"(?s)<rootfile\b[^>]*\bfull-path\s*=\s*["']([^"']+)["']"#)
            .expect("valid regex"),
        item: Regex::new(r"(?s)<(?:opf:)?item\b([^>]*)/?>").expect("valid regex"),
        itemref: Regex::new(r"(?s)<(?:opf:)?itemref\b([^>]*)/?>").expect("valid regex"),
        attr: Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("valid regex"),
        dc: Regex::new(r"(?s)<dc:(identifier|title|language|creator)\b[^>]*>(.*?)</dc:(?:identifier|title|language|creator)>")
            .expect("valid regex"),
    })
}

fn attributes(raw: &str) -> HashMap<String, String> {
    opf_patterns()
        .attr
        .captures_iter(raw)
        .map(|caps| {
            let value = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
            (
                caps[1].to_string(),
                html_escape::decode_html_entities(value).into_owned(),
            )
        })
        .collect()
}

struct ManifestItem {
    href: String,
    media_type: String,
    properties: String,
}

/// Reads an EPUB into its metadata, spine-ordered chapters and pass-through
/// resources.
pub fn read_book(path: &Path) -> Result<Book> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    read_book_from(file).with_context(|| format!("reading e-book {}", path.display()))
}

pub fn read_book_from<R: Read + Seek>(reader: R) -> Result<Book> {
    let mut archive = zip::ZipArchive::new(reader).context("not a zip archive")?;
    let p = opf_patterns();

    let container = read_entry_string(&mut archive, "META-INF/container.xml")?;
    let opf_path = p
        .rootfile
        .captures(&container)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| anyhow!("container.xml names no rootfile"))?;
    let opf_dir = match opf_path.rfind('/') {
        Some(idx) => &opf_path[..=idx],
        None => "",
    };
    let opf = read_entry_string(&mut archive, &opf_path)?;

    let metadata = read_metadata(&opf);

    let mut manifest: HashMap<String, ManifestItem> = HashMap::new();
    let mut manifest_order = Vec::new();
    for caps in p.item.captures_iter(&opf) {
        let attrs = attributes(&caps[1]);
        let (Some(id), Some(href)) = (attrs.get("id"), attrs.get("href")) else {
            continue;
        };
        manifest_order.push(id.clone());
        manifest.insert(
            id.clone(),
            ManifestItem {
                href: href.clone(),
                media_type: attrs.get("media-type").cloned().unwrap_or_default(),
                properties: attrs.get("properties").cloned().unwrap_or_default(),
            },
        );
    }

    let mut chapters = Vec::new();
    for caps in p.itemref.captures_iter(&opf) {
        let attrs = attributes(&caps[1]);
        let Some(item) = attrs.get("idref").and_then(|id| manifest.get(id)) else {
            continue;
        };
        if item.media_type != XHTML || is_nav(item) {
            continue;
        }
        let markup = read_entry_string(&mut archive, &resolve(opf_dir, &item.href))?;
        let title = markup::find_title(&markup).unwrap_or_else(|| item.href.clone());
        chapters.push(Chapter {
            name: item.href.clone(),
            title,
            markup,
        });
    }
    if chapters.is_empty() {
        bail!("e-book has no readable chapters in its spine");
    }

    let mut resources = Vec::new();
    for id in &manifest_order {
        let item = &manifest[id];
        if !is_resource(item) {
            continue;
        }
        let mut data = Vec::new();
        archive
            .by_name(&resolve(opf_dir, &item.href))
            .with_context(|| format!("missing manifest entry {}", item.href))?
            .read_to_end(&mut data)?;
        resources.push(Resource {
            href: item.href.clone(),
            media_type: item.media_type.clone(),
            data,
        });
    }

    tracing::info!(
        title = metadata.title.as_deref().unwrap_or("untitled"),
        chapters = chapters.len(),
        resources = resources.len(),
        "Read e-book"
    );
    Ok(Book {
        metadata,
        chapters,
        resources,
    })
}

fn read_metadata(opf: &str) -> BookMetadata {
    let mut metadata = BookMetadata::default();
    for caps in opf_patterns().dc.captures_iter(opf) {
        let value = html_escape::decode_html_entities(caps[2].trim()).into_owned();
        if value.is_empty() {
            continue;
        }
        match &caps[1] {
            "identifier" if metadata.identifier.is_none() => metadata.identifier = Some(value),
            "title" if metadata.title.is_none() => metadata.title = Some(value),
            "language" if metadata.language.is_none() => metadata.language = Some(value),
            "creator" => metadata.creators.push(value),
            _ => {}
        }
    }
    metadata
}

fn is_nav(item: &ManifestItem) -> bool {
    item.properties.split_whitespace().any(|p| p == "nav")
}

fn is_resource(item: &ManifestItem) -> bool {
    // epub-builder writes its own stylesheet under this name
    if item.href == "stylesheet.css" {
        return false;
    }
    let media = item.media_type.as_str();
    media.starts_with("image/")
        || media.starts_with("font/")
        || media == "text/css"
        || media.contains("opentype")
        || media.contains("font-woff")
}

/// Joins an OPF-relative href onto the OPF's directory, folding `..` segments.
fn resolve(opf_dir: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let mut parts: Vec<&str> = Vec::new();
    for segment in opf_dir.split('/').chain(href.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn read_entry_string<R: Read + Seek>(archive: &mut zip::ZipArchive<R>, name: &str) -> Result<String> {
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("missing archive entry {name}"))?;
    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .with_context(|| format!("archive entry {name} is not UTF-8 text"))?;
    Ok(text)
}

/// epub-builder's error type only promises `Display`.
fn builder_err(e: impl std::fmt::Display) -> anyhow::Error {
    anyhow!("building e-book: {e}")
}

/// Writes the summarized book: copied metadata, one document per chapter in
/// input order, and the original resources.
pub fn write_book(
    path: &Path,
    metadata: &BookMetadata,
    chapters: &[SummarizedChapter],
    resources: &[Resource],
) -> Result<()> {
    let mut builder = EpubBuilder::new(ZipLibrary::new().map_err(builder_err)?).map_err(builder_err)?;

    let title = match &metadata.title {
        Some(title) => format!("Summary of {title}"),
        None => "Summary".to_string(),
    };
    let lang = metadata.language.clone().unwrap_or_else(|| "en".to_string());
    builder.metadata("title", title.as_str()).map_err(builder_err)?;
    builder.metadata("lang", lang.as_str()).map_err(builder_err)?;
    builder.metadata("generator", "abridger").map_err(builder_err)?;
    for creator in &metadata.creators {
        builder.metadata("author", creator.as_str()).map_err(builder_err)?;
    }
    if let Some(identifier) = &metadata.identifier {
        builder
            .metadata("description", format!("Abridged from {identifier}"))
            .map_err(builder_err)?;
    }

    for resource in resources {
        builder
            .add_resource(&resource.href, resource.data.as_slice(), resource.media_type.as_str())
            .map_err(builder_err)?;
    }

    for (index, chapter) in chapters.iter().enumerate() {
        let document = markup::xhtml_document(&chapter.title, &chapter.fragment, &lang);
        builder
            .add_content(
                EpubContent::new(format!("summary_{:04}.xhtml", index + 1), document.as_bytes())
                    .title(chapter.title.as_str())
                    .reftype(ReferenceType::Text),
            )
            .map_err(builder_err)?;
    }

    let mut bytes = Vec::new();
    builder.generate(&mut bytes).map_err(builder_err)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(path = %path.display(), chapters = chapters.len(), "Wrote summarized e-book");
    Ok(())
}
