#![allow(dead_code)]

use abridger::services::llm::{Oracle, OracleError};
use async_trait::async_trait;
use std::io::{Cursor, Write};
use std::sync::Mutex;
use zip::write::FileOptions;

/// Answers every prompt with a closure and remembers what it was asked.
pub struct RecordingOracle {
    reply: Box<dyn Fn(&str) -> Result<String, OracleError> + Send + Sync>,
    prompts: Mutex<Vec<String>>,
}

impl RecordingOracle {
    pub fn new(reply: impl Fn(&str) -> Result<String, OracleError> + Send + Sync + 'static) -> Self {
        Self {
            reply: Box::new(reply),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Oracle for RecordingOracle {
    async fn respond(&self, prompt: &str) -> Result<String, OracleError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        (self.reply)(prompt)
    }
}

/// Text between the chunk fences of a rewrite prompt.
pub fn chunk_of(prompt: &str) -> Option<&str> {
    let marker = "TEXT CHUNK TO REWRITE:\n```\n";
    let start = prompt.find(marker)? + marker.len();
    let end = start + prompt[start..].find("\n```")?;
    Some(&prompt[start..end])
}

/// Minimal EPUB 3: OPF under OEBPS/, a nav document, chapters in spine
/// order and one image.
pub fn build_epub(chapters: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let stored = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

    zip.start_file("mimetype", stored).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();

    zip.start_file("META-INF/container.xml", FileOptions::default()).unwrap();
    zip.write_all(
        br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
    )
    .unwrap();

    let mut manifest = String::from(
        r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item href="images/cover.png" id="cover" media-type="image/png"/>
"#,
    );
    let mut spine = String::from("<itemref idref=\"nav\"/>\n");
    for i in 0..chapters.len() {
        manifest.push_str(&format!(
            "    <item id=\"c{i}\" href=\"text/ch{i}.xhtml\" media-type=\"application/xhtml+xml\"/>\n"
        ));
        spine.push_str(&format!("    <itemref idref=\"c{i}\"/>\n"));
    }

    let opf = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="uid">urn:uuid:test-book</dc:identifier>
    <dc:title>The Long Voyage</dc:title>
    <dc:language>en</dc:language>
    <dc:creator>A. Writer</dc:creator>
  </metadata>
  <manifest>
    {manifest}
  </manifest>
  <spine>
    {spine}
  </spine>
</package>"#
    );
    zip.start_file("OEBPS/content.opf", FileOptions::default()).unwrap();
    zip.write_all(opf.as_bytes()).unwrap();

    zip.start_file("OEBPS/nav.xhtml", FileOptions::default()).unwrap();
    zip.write_all(b"<html><body><nav><ol><li>Contents</li></ol></nav></body></html>")
        .unwrap();

    zip.start_file("OEBPS/images/cover.png", FileOptions::default()).unwrap();
    zip.write_all(&[0x89, b'P', b'N', b'G']).unwrap();

    for (i, (title, body)) in chapters.iter().enumerate() {
        let paragraphs: String = body
            .split("\n\n")
            .map(|p| format!("<p>{p}</p>\n"))
            .collect();
        let xhtml = format!(
            "<?xml version=\"1.0\"?><html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>{title}</title></head>\
             <body><h1>{title}</h1>\n{paragraphs}</body></html>"
        );
        zip.start_file(format!("OEBPS/text/ch{i}.xhtml"), FileOptions::default())
            .unwrap();
        zip.write_all(xhtml.as_bytes()).unwrap();
    }

    zip.finish().unwrap().into_inner()
}

/// Name and contents of every XHTML entry in an EPUB.
pub fn epub_documents(bytes: &[u8]) -> Vec<(String, String)> {
    use std::io::Read;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    let mut docs = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        let name = entry.name().to_string();
        if name.ends_with(".xhtml") {
            let mut text = String::new();
            entry.read_to_string(&mut text).unwrap();
            docs.push((name, text));
        }
    }
    docs
}
