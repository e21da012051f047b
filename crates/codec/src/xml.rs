use anyhow::Result;
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt::Display;
use std::io::{Cursor, Write};

use registry::{Artifact, Webapp};

use crate::{CodecError, ExportFormat, RawWebapp, FORMAT_VERSION};

const ROOT: &str = "webshelfExport";

pub(crate) fn export_xml(webapps: &[Webapp]) -> Result<String> {
    let mut buffer = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut buffer));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new(ROOT);
    root.push_attribute(("version", FORMAT_VERSION));
    root.push_attribute(("exportDate", Utc::now().to_rfc3339().as_str()));
    writer.write_event(Event::Start(root))?;

    writer.write_event(Event::Start(BytesStart::new("webapps")))?;
    for app in webapps {
        write_webapp(&mut writer, app)?;
    }
    writer.write_event(Event::End(BytesEnd::new("webapps")))?;
    writer.write_event(Event::End(BytesEnd::new(ROOT)))?;

    Ok(String::from_utf8(buffer)?)
}

fn write_webapp<W: Write>(writer: &mut Writer<W>, app: &Webapp) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new("webapp")))?;

    write_text_element(writer, "id", &app.id)?;
    write_text_element(writer, "name", &app.name)?;
    write_text_element(writer, "description", &app.description)?;
    write_text_element(writer, "category", &app.category)?;

    writer.write_event(Event::Start(BytesStart::new("tags")))?;
    for tag in &app.tags {
        write_text_element(writer, "tag", tag)?;
    }
    writer.write_event(Event::End(BytesEnd::new("tags")))?;

    write_text_element(writer, "fileName", &app.file_name)?;
    // Source text is arbitrary markup; carry it as a literal block instead
    // of entity-escaping every angle bracket.
    write_cdata_element(writer, "fileContent", &app.file_content)?;

    match &app.screenshot {
        Artifact::Pending => {
            let mut el = BytesStart::new("screenshot");
            el.push_attribute(("type", "pending"));
            writer.write_event(Event::Empty(el))?;
        }
        Artifact::Image { url, title } => {
            let mut el = BytesStart::new("screenshot");
            el.push_attribute(("type", "image"));
            writer.write_event(Event::Start(el))?;
            write_text_element(writer, "title", title)?;
            write_cdata_element(writer, "url", url)?;
            writer.write_event(Event::End(BytesEnd::new("screenshot")))?;
        }
        Artifact::Text { title, preview } => {
            let mut el = BytesStart::new("screenshot");
            el.push_attribute(("type", "text"));
            writer.write_event(Event::Start(el))?;
            write_text_element(writer, "title", title)?;
            write_cdata_element(writer, "preview", preview)?;
            writer.write_event(Event::End(BytesEnd::new("screenshot")))?;
        }
    }

    write_text_element(writer, "dateAdded", &app.date_added.to_rfc3339())?;
    if let Some(last_used) = app.last_used {
        write_text_element(writer, "lastUsed", &last_used.to_rfc3339())?;
    }
    write_text_element(writer, "lastModified", &app.last_modified.to_rfc3339())?;
    write_text_element(writer, "usageCount", &app.usage_count.to_string())?;

    writer.write_event(Event::End(BytesEnd::new("webapp")))?;
    Ok(())
}

fn write_text_element<W: Write>(writer: &mut Writer<W>, tag: &str, value: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(value)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn write_cdata_element<W: Write>(writer: &mut Writer<W>, tag: &str, value: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    let mut parts = value.split("]]>").peekable();
    while let Some(part) = parts.next() {
        writer.write_event(Event::CData(BytesCData::new(part)))?;
        if parts.peek().is_some() {
            // A literal "]]>" cannot sit inside one CDATA section; emit it
            // split across two adjacent sections.
            writer.write_event(Event::CData(BytesCData::new("]]")))?;
            writer.write_event(Event::CData(BytesCData::new(">")))?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

struct ShotBuilder {
    kind: String,
    title: Option<String>,
    url: Option<String>,
    preview: Option<String>,
}

impl ShotBuilder {
    fn new(kind: String) -> Self {
        Self {
            kind,
            title: None,
            url: None,
            preview: None,
        }
    }

    fn finish(self) -> Result<Artifact, CodecError> {
        match self.kind.as_str() {
            "pending" => Ok(Artifact::Pending),
            "image" => Ok(Artifact::Image {
                url: self.url.unwrap_or_default(),
                title: self.title.unwrap_or_default(),
            }),
            "text" => Ok(Artifact::Text {
                title: self.title.unwrap_or_default(),
                preview: self.preview.unwrap_or_default(),
            }),
            other => Err(xml_err(format!("unknown screenshot type {other:?}"))),
        }
    }
}

pub(crate) fn import_xml(text: &str) -> Result<Vec<RawWebapp>, CodecError> {
    let mut reader = Reader::from_str(text);
    // No whitespace trimming: leaf text is only collected while a field is
    // open, and the exporter emits no inter-element whitespace of its own.

    let mut out: Vec<RawWebapp> = Vec::new();
    let mut current: Option<RawWebapp> = None;
    let mut shot: Option<ShotBuilder> = None;
    let mut field: Option<String> = None;
    let mut text_buf = String::new();
    let mut in_tags = false;
    let mut seen_root = false;

    let mut buf = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf).map_err(xml_err)?;
        match event {
            Event::Start(e) => {
                let name = element_name(e.name().as_ref())?;
                match name.as_str() {
                    n if n == ROOT => seen_root = true,
                    "webapps" => {}
                    "webapp" => current = Some(RawWebapp::default()),
                    "tags" if current.is_some() => in_tags = true,
                    "tag" if in_tags => {
                        field = Some(name);
                        text_buf.clear();
                    }
                    "screenshot" if current.is_some() => {
                        let kind = attr_value(&e, "type")?.unwrap_or_default();
                        shot = Some(ShotBuilder::new(kind));
                    }
                    _ if current.is_some() => {
                        field = Some(name);
                        text_buf.clear();
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                let name = element_name(e.name().as_ref())?;
                if name == "screenshot" {
                    if let Some(current) = current.as_mut() {
                        let kind = attr_value(&e, "type")?.unwrap_or_default();
                        current.screenshot = Some(ShotBuilder::new(kind).finish()?);
                    }
                } else if current.is_some() {
                    assign(current.as_mut(), shot.as_mut(), &name, String::new())?;
                }
            }
            Event::Text(e) => {
                if field.is_some() {
                    text_buf.push_str(&e.unescape().map_err(xml_err)?);
                }
            }
            Event::CData(e) => {
                if field.is_some() {
                    let chunk = std::str::from_utf8(&e.into_inner())
                        .map_err(xml_err)?
                        .to_string();
                    text_buf.push_str(&chunk);
                }
            }
            Event::End(e) => {
                let name = element_name(e.name().as_ref())?;
                match name.as_str() {
                    "webapp" => {
                        if let Some(done) = current.take() {
                            out.push(done);
                        }
                    }
                    "tags" => in_tags = false,
                    "tag" => {
                        if let Some(current) = current.as_mut() {
                            current.tags.push(std::mem::take(&mut text_buf));
                        }
                        field = None;
                    }
                    "screenshot" => {
                        if let (Some(current), Some(builder)) = (current.as_mut(), shot.take()) {
                            current.screenshot = Some(builder.finish()?);
                        }
                    }
                    _ => {
                        if field.as_deref() == Some(name.as_str()) {
                            field = None;
                            let value = std::mem::take(&mut text_buf);
                            assign(current.as_mut(), shot.as_mut(), &name, value)?;
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !seen_root {
        return Err(xml_err(format!("missing <{ROOT}> root element")));
    }
    if current.is_some() || shot.is_some() {
        return Err(xml_err("unexpected end of document"));
    }
    Ok(out)
}

fn assign(
    current: Option<&mut RawWebapp>,
    shot: Option<&mut ShotBuilder>,
    field: &str,
    value: String,
) -> Result<(), CodecError> {
    if let Some(shot) = shot {
        match field {
            "title" => {
                shot.title = Some(value);
                return Ok(());
            }
            "url" => {
                shot.url = Some(value);
                return Ok(());
            }
            "preview" => {
                shot.preview = Some(value);
                return Ok(());
            }
            _ => {}
        }
    }
    let Some(current) = current else {
        return Ok(());
    };
    match field {
        "id" => current.id = Some(value),
        "name" => current.name = Some(value),
        "description" => current.description = Some(value),
        "category" => current.category = Some(value),
        "fileName" => current.file_name = Some(value),
        "fileContent" => current.file_content = Some(value),
        // Empty typed elements in hand-edited files fall back to defaults.
        "dateAdded" if !value.trim().is_empty() => {
            current.date_added = Some(parse_date(&value)?)
        }
        "lastUsed" if !value.trim().is_empty() => current.last_used = Some(parse_date(&value)?),
        "lastModified" if !value.trim().is_empty() => {
            current.last_modified = Some(parse_date(&value)?)
        }
        "usageCount" if !value.trim().is_empty() => {
            current.usage_count = Some(
                value
                    .trim()
                    .parse()
                    .map_err(|_| xml_err(format!("invalid usageCount {value:?}")))?,
            )
        }
        // Unknown elements are ignored for forward compatibility.
        _ => {}
    }
    Ok(())
}

fn parse_date(value: &str) -> Result<DateTime<Utc>, CodecError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| xml_err(format!("invalid timestamp {value:?}: {err}")))
}

fn element_name(bytes: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(xml_err)
}

fn attr_value(e: &BytesStart<'_>, key: &str) -> Result<Option<String>, CodecError> {
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        if attr.key.as_ref() == key.as_bytes() {
            return Ok(Some(attr.unescape_value().map_err(xml_err)?.into_owned()));
        }
    }
    Ok(None)
}

fn xml_err(detail: impl Display) -> CodecError {
    CodecError::Format {
        format: ExportFormat::Xml,
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdata_split_survives_hostile_content() {
        let mut app = Webapp::new("Hostile", "h.html", "a]]>b]]>c");
        app.id = "id-h".to_string();
        let text = export_xml(std::slice::from_ref(&app)).unwrap();
        let back = import_xml(&text).unwrap();
        assert_eq!(back[0].file_content.as_deref(), Some("a]]>b]]>c"));
    }

    #[test]
    fn test_escaped_specials_in_text_fields() {
        let mut app = Webapp::new("a <b> & \"c\" 'd'", "x.html", "<html></html>");
        app.id = "id-x".to_string();
        let text = export_xml(std::slice::from_ref(&app)).unwrap();
        assert!(text.contains("a &lt;b&gt; &amp;"));
        let back = import_xml(&text).unwrap();
        assert_eq!(back[0].name.as_deref(), Some("a <b> & \"c\" 'd'"));
    }

    #[test]
    fn test_missing_root_is_format_error() {
        let err = import_xml("<whatever/>").unwrap_err();
        assert!(matches!(err, CodecError::Format { .. }));
    }

    #[test]
    fn test_empty_tags_element_round_trips() {
        let mut app = Webapp::new("No tags", "n.html", "<html></html>");
        app.id = "id-n".to_string();
        app.tags.clear();
        let text = export_xml(std::slice::from_ref(&app)).unwrap();
        let back = import_xml(&text).unwrap();
        assert!(back[0].tags.is_empty());
    }
}
