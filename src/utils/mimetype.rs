use crate::models::ContentType;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// How many header bytes the magic sniffer looks at.
pub const MAGIC_HEADER_LEN: usize = 32;

const OCTET_STREAM: &str = "application/octet-stream";

/// Lowercase extension lookup. First resolution step; the magic sniffer only
/// runs when the extension is absent or unknown.
pub fn classify_extension(ext: &str) -> Option<(&'static str, ContentType)> {
    let entry = match ext {
        "jpg" | "jpeg" => ("image/jpeg", ContentType::Image),
        "png" => ("image/png", ContentType::Image),
        "gif" => ("image/gif", ContentType::Image),
        "webp" => ("image/webp", ContentType::Image),
        "bmp" => ("image/bmp", ContentType::Image),
        "heic" => ("image/heic", ContentType::Image),
        "svg" => ("image/svg+xml", ContentType::Image),
        "tif" | "tiff" => ("image/tiff", ContentType::Image),

        "mp4" => ("video/mp4", ContentType::Video),
        "mkv" => ("video/x-matroska", ContentType::Video),
        "avi" => ("video/x-msvideo", ContentType::Video),
        "mov" => ("video/quicktime", ContentType::Video),
        "webm" => ("video/webm", ContentType::Video),
        "3gp" => ("video/3gpp", ContentType::Video),

        "mp3" => ("audio/mpeg", ContentType::Audio),
        "wav" => ("audio/wav", ContentType::Audio),
        "flac" => ("audio/flac", ContentType::Audio),
        "ogg" => ("audio/ogg", ContentType::Audio),
        "m4a" => ("audio/mp4", ContentType::Audio),
        "aac" => ("audio/aac", ContentType::Audio),

        "txt" | "log" => ("text/plain", ContentType::Document),
        "md" => ("text/markdown", ContentType::Document),
        "pdf" => ("application/pdf", ContentType::Document),
        "doc" => ("application/msword", ContentType::Document),
        "docx" => (
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            ContentType::Document,
        ),
        "xls" => ("application/vnd.ms-excel", ContentType::Document),
        "xlsx" => (
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            ContentType::Document,
        ),
        "ppt" => ("application/vnd.ms-powerpoint", ContentType::Document),
        "pptx" => (
            "application/vnd.openxmlformats-officedocument.presentationml.presentation",
            ContentType::Document,
        ),
        "csv" => ("text/csv", ContentType::Document),
        "rtf" => ("application/rtf", ContentType::Document),
        "odt" => ("application/vnd.oasis.opendocument.text", ContentType::Document),
        "html" | "htm" => ("text/html", ContentType::Document),
        "json" => ("application/json", ContentType::Document),
        "xml" => ("application/xml", ContentType::Document),

        "zip" => ("application/zip", ContentType::Archive),
        "rar" => ("application/vnd.rar", ContentType::Archive),
        "7z" => ("application/x-7z-compressed", ContentType::Archive),
        "tar" => ("application/x-tar", ContentType::Archive),
        "gz" => ("application/gzip", ContentType::Archive),
        "bz2" => ("application/x-bzip2", ContentType::Archive),

        "exe" | "dll" => (
            "application/vnd.microsoft.portable-executable",
            ContentType::Other,
        ),
        _ => return None,
    };
    Some(entry)
}

/// Fixed magic-signature list over up to 32 header bytes. RIFF containers are
/// ambiguous between WebP and AVI; bytes 8..12 disambiguate.
pub fn sniff_magic(header: &[u8]) -> Option<(&'static str, ContentType)> {
    if header.len() >= 12 && header.starts_with(b"RIFF") {
        return match &header[8..12] {
            b"WEBP" => Some(("image/webp", ContentType::Image)),
            b"AVI " => Some(("video/x-msvideo", ContentType::Video)),
            _ => None,
        };
    }
    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(("image/jpeg", ContentType::Image));
    }
    if header.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(("image/png", ContentType::Image));
    }
    if header.starts_with(b"GIF8") {
        return Some(("image/gif", ContentType::Image));
    }
    if header.starts_with(b"%PDF") {
        return Some(("application/pdf", ContentType::Document));
    }
    if header.starts_with(&[0x50, 0x4B, 0x03, 0x04])
        || header.starts_with(&[0x50, 0x4B, 0x05, 0x06])
        || header.starts_with(&[0x50, 0x4B, 0x07, 0x08])
    {
        return Some(("application/zip", ContentType::Archive));
    }
    if header.starts_with(b"Rar!\x1a\x07") {
        return Some(("application/vnd.rar", ContentType::Archive));
    }
    if header.starts_with(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C]) {
        return Some(("application/x-7z-compressed", ContentType::Archive));
    }
    if header.starts_with(b"ID3")
        || header.starts_with(&[0xFF, 0xFB])
        || header.starts_with(&[0xFF, 0xF3])
        || header.starts_with(&[0xFF, 0xF2])
    {
        return Some(("audio/mpeg", ContentType::Audio));
    }
    if header.len() >= 8 && &header[4..8] == b"ftyp" {
        return Some(("video/mp4", ContentType::Video));
    }
    if header.starts_with(b"BM") {
        return Some(("image/bmp", ContentType::Image));
    }
    if header.starts_with(&[0x1F, 0x8B]) {
        return Some(("application/gzip", ContentType::Archive));
    }
    if header.starts_with(b"MZ") {
        return Some((
            "application/vnd.microsoft.portable-executable",
            ContentType::Other,
        ));
    }
    None
}

/// Resolve `(mime, content type)` for a file. Extension table first, magic
/// bytes second; unreadable or unrecognized files fall back to octet-stream.
/// Never errors.
pub async fn classify_path(path: &Path, ext: &str) -> (String, ContentType) {
    if let Some((mime, content_type)) = classify_extension(ext) {
        return (mime.to_string(), content_type);
    }
    let header = read_header(path).await;
    match header.as_deref().and_then(sniff_magic) {
        Some((mime, content_type)) => (mime.to_string(), content_type),
        None => (OCTET_STREAM.to_string(), ContentType::Other),
    }
}

pub async fn read_header(path: &Path) -> Option<Vec<u8>> {
    let mut file = File::open(path).await.ok()?;
    let mut buf = vec![0u8; MAGIC_HEADER_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return None,
        }
    }
    buf.truncate(filled);
    Some(buf)
}

/// Coarse bucket for a mime string; used when only a mime crosses the wire.
pub fn content_type_for_mime(mime: &str) -> ContentType {
    if mime.starts_with("image/") {
        ContentType::Image
    } else if mime.starts_with("video/") {
        ContentType::Video
    } else if mime.starts_with("audio/") {
        ContentType::Audio
    } else if mime.starts_with("text/")
        || mime == "application/pdf"
        || mime == "application/json"
        || mime == "application/xml"
        || mime.starts_with("application/vnd.openxmlformats")
        || mime.starts_with("application/vnd.oasis.opendocument")
        || mime == "application/msword"
        || mime == "application/rtf"
    {
        ContentType::Document
    } else if mime == "application/zip"
        || mime == "application/gzip"
        || mime == "application/x-tar"
        || mime == "application/vnd.rar"
        || mime == "application/x-7z-compressed"
        || mime == "application/x-bzip2"
    {
        ContentType::Archive
    } else if mime == OCTET_STREAM {
        ContentType::Other
    } else {
        ContentType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_lookup_wins() {
        assert_eq!(
            classify_extension("jpg"),
            Some(("image/jpeg", ContentType::Image))
        );
        assert_eq!(classify_extension("bak"), None);
    }

    #[test]
    fn riff_disambiguation() {
        let webp = b"RIFF\x00\x00\x00\x00WEBPVP8 ";
        assert_eq!(
            sniff_magic(webp),
            Some(("image/webp", ContentType::Image))
        );
        let avi = b"RIFF\x00\x00\x00\x00AVI LIST";
        assert_eq!(
            sniff_magic(avi),
            Some(("video/x-msvideo", ContentType::Video))
        );
        let other_riff = b"RIFF\x00\x00\x00\x00WAVEfmt ";
        assert_eq!(sniff_magic(other_riff), None);
    }

    #[test]
    fn common_signatures() {
        assert_eq!(
            sniff_magic(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some(("image/jpeg", ContentType::Image))
        );
        assert_eq!(
            sniff_magic(b"%PDF-1.7"),
            Some(("application/pdf", ContentType::Document))
        );
        assert_eq!(
            sniff_magic(&[0x50, 0x4B, 0x03, 0x04, 0x00]),
            Some(("application/zip", ContentType::Archive))
        );
        assert_eq!(
            sniff_magic(b"\x00\x00\x00\x18ftypmp42"),
            Some(("video/mp4", ContentType::Video))
        );
        assert_eq!(sniff_magic(b"nothing recognizable"), None);
    }

    #[tokio::test]
    async fn unreadable_file_falls_back_to_octet_stream() {
        let (mime, content_type) =
            classify_path(Path::new("/definitely/not/here.weird"), "weird").await;
        assert_eq!(mime, "application/octet-stream");
        assert_eq!(content_type, ContentType::Other);
    }

    #[test]
    fn mime_buckets() {
        assert_eq!(content_type_for_mime("image/png"), ContentType::Image);
        assert_eq!(content_type_for_mime("text/plain"), ContentType::Document);
        assert_eq!(content_type_for_mime("application/zip"), ContentType::Archive);
        assert_eq!(
            content_type_for_mime("application/octet-stream"),
            ContentType::Other
        );
    }
}
