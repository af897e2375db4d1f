//! Reads and patches the compiled `AndroidManifest.xml`.
//!
//! Only the chunks that are edited get re-encoded: the string pool (new names are appended,
//! so existing indices and the resource map stay valid) and the `<application>` start
//! element. Every other chunk is carried over byte for byte.
use thiserror::Error;

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;

const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;
const STRING_FLAG_SORTED: u32 = 0x0000_0001;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;

const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";
/// `android:name` in the framework resource table.
const ATTR_NAME_RESOURCE_ID: u32 = 0x0101_0003;

const TYPE_STRING: u8 = 0x03;

const ATTRIBUTE_SIZE: usize = 20;
/// Offset of the attribute array inside a start element chunk.
const START_ELEMENT_ATTRS: usize = 36;

pub const PLATFORM_APPLICATION: &str = "android.app.Application";

pub type ManifestResult<T> = Result<T, ManifestError>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ManifestError {
    #[error("malformed manifest: {0}")]
    Malformed(String),

    #[error("manifest has no <{0}> element")]
    MissingElement(&'static str),

    #[error("manifest has no package attribute")]
    MissingPackage,

    #[error("cannot add android:name: {0}")]
    CannotInsertName(String),
}

fn malformed(msg: impl Into<String>) -> ManifestError {
    ManifestError::Malformed(msg.into())
}

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    chunk_size: u32,
    start: usize,
}

impl ChunkHeader {
    fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }
}

struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    fn at(data: &'a [u8], pos: usize) -> Self {
        BinaryReader { data, pos }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn read_u8(&mut self) -> ManifestResult<u8> {
        let value = *self
            .data
            .get(self.pos)
            .ok_or_else(|| malformed("unexpected end of binary XML"))?;
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> ManifestResult<u16> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 2)
            .ok_or_else(|| malformed("unexpected end of binary XML"))?;
        self.pos += 2;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> ManifestResult<u32> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| malformed("unexpected end of binary XML"))?;
        self.pos += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn seek(&mut self, offset: usize) -> ManifestResult<()> {
        if offset > self.data.len() {
            return Err(malformed("attempted to seek past end of document"));
        }
        self.pos = offset;
        Ok(())
    }

    fn chunk_header(&mut self) -> ManifestResult<ChunkHeader> {
        let start = self.position();
        let chunk_type = self.read_u16()?;
        let header_size = self.read_u16()?;
        let chunk_size = self.read_u32()?;
        if chunk_size < header_size as u32 || chunk_size < 8 {
            return Err(malformed("invalid chunk sizing"));
        }
        let end = start
            .checked_add(chunk_size as usize)
            .ok_or_else(|| malformed("chunk size overflow"))?;
        if end > self.data.len() {
            return Err(malformed("chunk extends past end of document"));
        }
        Ok(ChunkHeader {
            chunk_type,
            header_size,
            chunk_size,
            start,
        })
    }
}

/// The document string pool, with its style spans kept opaque.
#[derive(Debug, Clone)]
struct StringPool {
    strings: Vec<String>,
    flags: u32,
    style_offsets: Vec<u32>,
    style_data: Vec<u8>,
}

impl StringPool {
    fn parse(data: &[u8], header: &ChunkHeader) -> ManifestResult<Self> {
        let mut reader = BinaryReader::at(data, header.start + 8);
        let string_count = reader.read_u32()? as usize;
        let style_count = reader.read_u32()? as usize;
        let flags = reader.read_u32()?;
        let strings_start = reader.read_u32()? as usize;
        let styles_start = reader.read_u32()? as usize;
        reader.seek(header.start + header.header_size as usize)?;

        // offsets alone need four bytes per entry
        let max_entries = header.chunk_size as usize / 4;
        if string_count > max_entries || style_count > max_entries {
            return Err(malformed(format!(
                "string pool claims {} strings and {} styles in {} bytes",
                string_count, style_count, header.chunk_size
            )));
        }
        let mut string_offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            string_offsets.push(reader.read_u32()? as usize);
        }
        let mut style_offsets = Vec::with_capacity(style_count);
        for _ in 0..style_count {
            style_offsets.push(reader.read_u32()?);
        }

        let utf8 = flags & STRING_FLAG_UTF8 != 0;
        let strings_base = header.start + strings_start;
        let chunk_end = header.end();
        let mut strings = Vec::with_capacity(string_count);
        for offset in string_offsets {
            let absolute = strings_base + offset;
            strings.push(if utf8 {
                read_utf8_string(data, absolute, chunk_end)?
            } else {
                read_utf16_string(data, absolute, chunk_end)?
            });
        }

        let style_data = if style_count > 0 && styles_start != 0 {
            let from = header.start + styles_start;
            data.get(from..chunk_end)
                .ok_or_else(|| malformed("style data outside string pool"))?
                .to_vec()
        } else {
            Vec::new()
        };

        Ok(StringPool {
            strings,
            flags,
            style_offsets,
            style_data,
        })
    }

    fn get(&self, idx: u32) -> Option<&str> {
        if idx == NO_ENTRY_INDEX {
            return None;
        }
        self.strings.get(idx as usize).map(|s| s.as_str())
    }

    fn index_of(&self, value: &str) -> Option<u32> {
        self.strings.iter().position(|s| s == value).map(|i| i as u32)
    }

    /// Index of `value`, appending it when absent.
    fn intern(&mut self, value: &str) -> u32 {
        match self.index_of(value) {
            Some(idx) => idx,
            None => {
                self.strings.push(value.to_string());
                // appended strings break the sort order
                self.flags &= !STRING_FLAG_SORTED;
                (self.strings.len() - 1) as u32
            }
        }
    }

    fn to_chunk(&self) -> Vec<u8> {
        let utf8 = self.flags & STRING_FLAG_UTF8 != 0;
        let header_size = 28u16;
        let mut string_data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for s in &self.strings {
            offsets.push(string_data.len() as u32);
            if utf8 {
                write_utf8_string(&mut string_data, s);
            } else {
                write_utf16_string(&mut string_data, s);
            }
        }
        align_to_four(&mut string_data);

        let strings_start = header_size as u32 + 4 * (self.strings.len() + self.style_offsets.len()) as u32;
        let styles_start = if self.style_offsets.is_empty() {
            0
        } else {
            strings_start + string_data.len() as u32
        };

        let mut chunk = Vec::new();
        let start = begin_chunk(&mut chunk, RES_STRING_POOL_TYPE, header_size);
        write_u32(&mut chunk, self.strings.len() as u32);
        write_u32(&mut chunk, self.style_offsets.len() as u32);
        write_u32(&mut chunk, self.flags);
        write_u32(&mut chunk, strings_start);
        write_u32(&mut chunk, styles_start);
        for offset in offsets {
            write_u32(&mut chunk, offset);
        }
        for offset in &self.style_offsets {
            write_u32(&mut chunk, *offset);
        }
        chunk.extend_from_slice(&string_data);
        chunk.extend_from_slice(&self.style_data);
        finalize_chunk(&mut chunk, start);
        chunk
    }
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> ManifestResult<(usize, usize)> {
    if offset >= limit {
        return Err(malformed("invalid UTF-8 length offset"));
    }
    let first = data[offset];
    if first & 0x80 == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            return Err(malformed("truncated UTF-8 length"));
        }
        Ok(((((first & 0x7F) as usize) << 8) | data[offset + 1] as usize, 2))
    }
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> ManifestResult<String> {
    let (_, char_len_size) = read_utf8_length(data, offset, limit)?;
    let mut cursor = offset + char_len_size;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len >= limit {
        return Err(malformed("UTF-8 string exceeds chunk bounds"));
    }
    let text = std::str::from_utf8(&data[cursor..cursor + byte_len]).map_err(|err| malformed(err.to_string()))?;
    Ok(text.to_string())
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> ManifestResult<(usize, usize)> {
    if offset + 2 > limit {
        return Err(malformed("invalid UTF-16 length offset"));
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if first & 0x8000 == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            return Err(malformed("truncated UTF-16 length"));
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        Ok(((((first & 0x7FFF) as usize) << 16) | second as usize, 4))
    }
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> ManifestResult<String> {
    let (char_count, header_bytes) = read_utf16_length(data, offset, limit)?;
    let cursor = offset + header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len + 2 > limit {
        return Err(malformed("UTF-16 string exceeds chunk bounds"));
    }
    let units: Vec<u16> = data[cursor..cursor + byte_len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|err| malformed(err.to_string()))
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_utf8_length(buf: &mut Vec<u8>, len: usize) {
    if len > 0x7F {
        buf.push(0x80 | ((len >> 8) as u8 & 0x7F));
    }
    buf.push(len as u8);
}

fn write_utf8_string(buf: &mut Vec<u8>, text: &str) {
    write_utf8_length(buf, text.encode_utf16().count());
    write_utf8_length(buf, text.len());
    buf.extend_from_slice(text.as_bytes());
    buf.push(0);
}

fn write_utf16_string(buf: &mut Vec<u8>, text: &str) {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = units.len();
    if len < 0x8000 {
        write_u16(buf, len as u16);
    } else {
        write_u16(buf, 0x8000 | ((len >> 16) as u16 & 0x7FFF));
        write_u16(buf, (len & 0xFFFF) as u16);
    }
    for unit in units {
        write_u16(buf, unit);
    }
    write_u16(buf, 0);
}

fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn begin_chunk(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    write_u16(buf, chunk_type);
    write_u16(buf, header_size);
    write_u32(buf, 0); // chunk size, patched by finalize_chunk
    start
}

fn finalize_chunk(buf: &mut Vec<u8>, chunk_start: usize) {
    align_to_four(buf);
    let size = (buf.len() - chunk_start) as u32;
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size.to_le_bytes());
}

/// One attribute record of a start element.
#[derive(Debug, Clone, Copy)]
struct RawAttribute {
    namespace: u32,
    name: u32,
    raw_value: u32,
    data_type: u8,
    data: u32,
}

impl RawAttribute {
    fn read(bytes: &[u8], pos: usize) -> ManifestResult<Self> {
        let mut r = BinaryReader::at(bytes, pos);
        let namespace = r.read_u32()?;
        let name = r.read_u32()?;
        let raw_value = r.read_u32()?;
        if r.read_u16()? != 8 {
            return Err(malformed("attribute value size must be 8"));
        }
        r.read_u8()?;
        let data_type = r.read_u8()?;
        let data = r.read_u32()?;
        Ok(RawAttribute {
            namespace,
            name,
            raw_value,
            data_type,
            data,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.namespace);
        write_u32(buf, self.name);
        write_u32(buf, self.raw_value);
        write_u16(buf, 8);
        buf.push(0);
        buf.push(self.data_type);
        write_u32(buf, self.data);
    }

    fn string_value<'p>(&self, pool: &'p StringPool) -> Option<&'p str> {
        pool.get(self.raw_value).or_else(|| {
            if self.data_type == TYPE_STRING {
                pool.get(self.data)
            } else {
                None
            }
        })
    }
}

/// A start element chunk decoded far enough to edit its attributes.
#[derive(Debug, Clone)]
struct StartElement {
    /// Line number, comment, namespace and name, copied through unchanged.
    prefix: [u32; 4],
    id_index: u16,
    class_index: u16,
    style_index: u16,
    attributes: Vec<RawAttribute>,
}

impl StartElement {
    fn parse(chunk: &[u8]) -> ManifestResult<Self> {
        let mut r = BinaryReader::at(chunk, 8);
        let prefix = [r.read_u32()?, r.read_u32()?, r.read_u32()?, r.read_u32()?];
        let attribute_start = r.read_u16()? as usize;
        let attribute_size = r.read_u16()? as usize;
        let count = r.read_u16()? as usize;
        let id_index = r.read_u16()?;
        let class_index = r.read_u16()?;
        let style_index = r.read_u16()?;
        if attribute_size != ATTRIBUTE_SIZE {
            return Err(malformed(format!("unsupported attribute size {attribute_size}")));
        }
        let base = 16 + attribute_start;
        let attributes = (0..count)
            .map(|i| RawAttribute::read(chunk, base + i * ATTRIBUTE_SIZE))
            .collect::<ManifestResult<Vec<_>>>()?;
        Ok(StartElement {
            prefix,
            id_index,
            class_index,
            style_index,
            attributes,
        })
    }

    fn name(&self) -> u32 {
        self.prefix[3]
    }

    fn to_chunk(&self) -> Vec<u8> {
        let mut chunk = Vec::new();
        let start = begin_chunk(&mut chunk, RES_XML_START_ELEMENT_TYPE, 16);
        for v in self.prefix {
            write_u32(&mut chunk, v);
        }
        write_u16(&mut chunk, (START_ELEMENT_ATTRS - 16) as u16);
        write_u16(&mut chunk, ATTRIBUTE_SIZE as u16);
        write_u16(&mut chunk, self.attributes.len() as u16);
        write_u16(&mut chunk, self.id_index);
        write_u16(&mut chunk, self.class_index);
        write_u16(&mut chunk, self.style_index);
        for a in &self.attributes {
            a.write(&mut chunk);
        }
        finalize_chunk(&mut chunk, start);
        chunk
    }
}

/// A compiled manifest split into its top-level chunks.
#[derive(Debug, Clone)]
pub struct BinaryManifest {
    chunks: Vec<Vec<u8>>,
    pool_chunk: usize,
    pool: StringPool,
    resource_map: Vec<u32>,
}

impl BinaryManifest {
    pub fn from_bytes(bytes: &[u8]) -> ManifestResult<Self> {
        let mut reader = BinaryReader::new(bytes);
        let xml = reader.chunk_header()?;
        if xml.chunk_type != RES_XML_TYPE {
            return Err(malformed("binary XML does not start with RES_XML_TYPE header"));
        }
        reader.seek(xml.start + xml.header_size as usize)?;

        let mut chunks = Vec::new();
        let mut pool = None;
        let mut resource_map = Vec::new();
        while reader.position() < xml.end() {
            let header = reader.chunk_header()?;
            match header.chunk_type {
                RES_STRING_POOL_TYPE if pool.is_none() => {
                    pool = Some((chunks.len(), StringPool::parse(bytes, &header)?));
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    let mut r = BinaryReader::at(bytes, header.start + header.header_size as usize);
                    while r.position() + 4 <= header.end() {
                        resource_map.push(r.read_u32()?);
                    }
                }
                _ => {}
            }
            chunks.push(bytes[header.start..header.end()].to_vec());
            reader.seek(header.end())?;
        }

        let (pool_chunk, pool) = pool.ok_or_else(|| malformed("manifest has no string pool"))?;
        Ok(BinaryManifest {
            chunks,
            pool_chunk,
            pool,
            resource_map,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let start = begin_chunk(&mut out, RES_XML_TYPE, 8);
        for (i, chunk) in self.chunks.iter().enumerate() {
            if i == self.pool_chunk {
                out.extend_from_slice(&self.pool.to_chunk());
            } else {
                out.extend_from_slice(chunk);
            }
        }
        finalize_chunk(&mut out, start);
        out
    }

    /// Position and decoded form of the first start element named `tag`.
    fn find_element(&self, tag: &'static str) -> ManifestResult<(usize, StartElement)> {
        let tag_idx = self.pool.index_of(tag).ok_or(ManifestError::MissingElement(tag))?;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.len() >= START_ELEMENT_ATTRS
                && u16::from_le_bytes([chunk[0], chunk[1]]) == RES_XML_START_ELEMENT_TYPE
            {
                let element = StartElement::parse(chunk)?;
                if element.name() == tag_idx {
                    return Ok((i, element));
                }
            }
        }
        Err(ManifestError::MissingElement(tag))
    }

    fn android_namespace(&self) -> Option<u32> {
        self.pool.index_of(ANDROID_NAMESPACE_URI)
    }

    /// String value of the attribute `name` in `namespace` (`None` for no namespace).
    fn attribute<'a>(&'a self, element: &StartElement, namespace: Option<u32>, name: &str) -> Option<&'a str> {
        let namespace = namespace.unwrap_or(NO_ENTRY_INDEX);
        element
            .attributes
            .iter()
            .find(|a| a.namespace == namespace && self.pool.get(a.name) == Some(name))
            .and_then(|a| a.string_value(&self.pool))
    }

    pub fn package_name(&self) -> ManifestResult<String> {
        let (_, manifest) = self.find_element("manifest")?;
        self.attribute(&manifest, None, "package")
            .map(str::to_string)
            .ok_or(ManifestError::MissingPackage)
    }

    /// The declared application class in dotted form, resolved against the package.
    ///
    /// An `<application>` without `android:name` runs the platform class.
    pub fn application_name(&self) -> ManifestResult<String> {
        let (_, application) = self.find_element("application")?;
        let Some(name) = self.attribute(&application, self.android_namespace(), "name") else {
            return Ok(PLATFORM_APPLICATION.to_string());
        };
        if name.starts_with('.') || !name.contains('.') {
            let package = self.package_name()?;
            let sep = if name.starts_with('.') { "" } else { "." };
            Ok(format!("{package}{sep}{name}"))
        } else {
            Ok(name.to_string())
        }
    }

    /// Point `<application android:name>` at `class_name`, adding the attribute if needed.
    pub fn set_application_name(&mut self, class_name: &str) -> ManifestResult<()> {
        let (pos, mut application) = self.find_element("application")?;
        let namespace = self
            .android_namespace()
            .ok_or_else(|| ManifestError::CannotInsertName("no android namespace".to_string()))?;
        let value = self.pool.intern(class_name);

        let existing = application
            .attributes
            .iter_mut()
            .find(|a| a.namespace == namespace && self.pool.get(a.name) == Some("name"));
        match existing {
            Some(attr) => {
                attr.raw_value = value;
                attr.data_type = TYPE_STRING;
                attr.data = value;
            }
            None => {
                // attributes are ordered by resource id, so the name string must be mapped
                let name_idx = self
                    .resource_map
                    .iter()
                    .position(|id| *id == ATTR_NAME_RESOURCE_ID)
                    .filter(|i| self.pool.get(*i as u32) == Some("name"))
                    .ok_or_else(|| {
                        ManifestError::CannotInsertName("no resource-mapped \"name\" string".to_string())
                    })? as u32;
                let resource_id = |a: &RawAttribute| self.resource_map.get(a.name as usize).copied().unwrap_or(0);
                let at = application
                    .attributes
                    .iter()
                    .position(|a| {
                        let id = resource_id(a);
                        id == 0 || id > ATTR_NAME_RESOURCE_ID
                    })
                    .unwrap_or(application.attributes.len());
                application.attributes.insert(
                    at,
                    RawAttribute {
                        namespace,
                        name: name_idx,
                        raw_value: value,
                        data_type: TYPE_STRING,
                        data: value,
                    },
                );
                shift_special_indices(&mut application, at);
            }
        }
        self.chunks[pos] = application.to_chunk();
        Ok(())
    }
}

/// id/class/style indices are 1-based attribute positions and move with an insertion.
fn shift_special_indices(element: &mut StartElement, inserted_at: usize) {
    for idx in [&mut element.id_index, &mut element.class_index, &mut element.style_index] {
        if *idx != 0 && (*idx as usize) > inserted_at {
            *idx += 1;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a small compiled manifest; `app_name` of `None` leaves out `android:name`.
    pub(crate) fn build_manifest(package: &str, app_name: Option<&str>, utf8: bool) -> Vec<u8> {
        // 0 name, 1 label, 2 android, 3 uri, 4 package, 5 manifest, 6 application, 7 package value
        let mut strings = vec![
            "name".to_string(),
            "label".to_string(),
            "android".to_string(),
            ANDROID_NAMESPACE_URI.to_string(),
            "package".to_string(),
            "manifest".to_string(),
            "application".to_string(),
            package.to_string(),
        ];
        if let Some(n) = app_name {
            strings.push(n.to_string());
        }
        let pool = StringPool {
            strings,
            flags: if utf8 { STRING_FLAG_UTF8 } else { 0 },
            style_offsets: Vec::new(),
            style_data: Vec::new(),
        };

        let mut body = pool.to_chunk();
        let start = begin_chunk(&mut body, RES_XML_RESOURCE_MAP_TYPE, 8);
        write_u32(&mut body, ATTR_NAME_RESOURCE_ID);
        write_u32(&mut body, 0x0101_0001);
        finalize_chunk(&mut body, start);

        let start = begin_chunk(&mut body, 0x0100, 16);
        for v in [1, NO_ENTRY_INDEX, 2, 3] {
            write_u32(&mut body, v);
        }
        finalize_chunk(&mut body, start);

        let manifest = StartElement {
            prefix: [1, NO_ENTRY_INDEX, NO_ENTRY_INDEX, 5],
            id_index: 0,
            class_index: 0,
            style_index: 0,
            attributes: vec![RawAttribute {
                namespace: NO_ENTRY_INDEX,
                name: 4,
                raw_value: 7,
                data_type: TYPE_STRING,
                data: 7,
            }],
        };
        body.extend_from_slice(&manifest.to_chunk());

        let mut attributes = Vec::new();
        if app_name.is_some() {
            attributes.push(RawAttribute {
                namespace: 3,
                name: 0,
                raw_value: 8,
                data_type: TYPE_STRING,
                data: 8,
            });
        }
        attributes.push(RawAttribute {
            namespace: 3,
            name: 1,
            raw_value: NO_ENTRY_INDEX,
            data_type: 0x01,
            data: 0x7f0e_0001,
        });
        let application = StartElement {
            prefix: [2, NO_ENTRY_INDEX, NO_ENTRY_INDEX, 6],
            id_index: 0,
            class_index: 0,
            style_index: 0,
            attributes,
        };
        body.extend_from_slice(&application.to_chunk());

        for (line, name) in [(3u32, 6u32), (4, 5)] {
            let start = begin_chunk(&mut body, 0x0103, 16);
            for v in [line, NO_ENTRY_INDEX, NO_ENTRY_INDEX, name] {
                write_u32(&mut body, v);
            }
            finalize_chunk(&mut body, start);
        }
        let start = begin_chunk(&mut body, 0x0101, 16);
        for v in [5, NO_ENTRY_INDEX, 2, 3] {
            write_u32(&mut body, v);
        }
        finalize_chunk(&mut body, start);

        let mut doc = Vec::new();
        let start = begin_chunk(&mut doc, RES_XML_TYPE, 8);
        doc.extend_from_slice(&body);
        finalize_chunk(&mut doc, start);
        doc
    }

    #[test]
    fn reads_package_and_application() {
        for utf8 in [false, true] {
            let bytes = build_manifest("com.example.app", Some("com.example.app.App"), utf8);
            let manifest = BinaryManifest::from_bytes(&bytes).unwrap();
            assert_eq!(manifest.package_name().unwrap(), "com.example.app");
            assert_eq!(manifest.application_name().unwrap(), "com.example.app.App");
            assert_eq!(manifest.to_bytes(), bytes);
        }
    }

    #[test]
    fn relative_names_resolve_against_package() {
        let bytes = build_manifest("com.example", Some(".Main"), false);
        let manifest = BinaryManifest::from_bytes(&bytes).unwrap();
        assert_eq!(manifest.application_name().unwrap(), "com.example.Main");
    }

    #[test]
    fn missing_name_means_platform_application() {
        let bytes = build_manifest("com.example", None, false);
        let manifest = BinaryManifest::from_bytes(&bytes).unwrap();
        assert_eq!(manifest.application_name().unwrap(), PLATFORM_APPLICATION);
    }

    #[test]
    fn renames_existing_attribute() {
        let bytes = build_manifest("com.example", Some("com.example.App"), true);
        let mut manifest = BinaryManifest::from_bytes(&bytes).unwrap();
        manifest.set_application_name("com.dexnative.protect.LoadLibApp").unwrap();
        let patched = BinaryManifest::from_bytes(&manifest.to_bytes()).unwrap();
        assert_eq!(patched.application_name().unwrap(), "com.dexnative.protect.LoadLibApp");
        assert_eq!(patched.package_name().unwrap(), "com.example");
    }

    #[test]
    fn inserts_name_in_resource_id_order() {
        let bytes = build_manifest("com.example", None, false);
        let mut manifest = BinaryManifest::from_bytes(&bytes).unwrap();
        manifest.set_application_name("com.dexnative.protect.LoadLibApp").unwrap();
        let patched = BinaryManifest::from_bytes(&manifest.to_bytes()).unwrap();
        assert_eq!(patched.application_name().unwrap(), "com.dexnative.protect.LoadLibApp");
        let (_, app) = patched.find_element("application").unwrap();
        // android:label (0x01010001) sorts ahead of android:name (0x01010003)
        assert_eq!(app.attributes.len(), 2);
        assert_eq!(app.attributes[0].name, 1);
        assert_eq!(app.attributes[1].name, 0);
    }

    #[test]
    fn forged_string_count_is_malformed() {
        let mut bytes = build_manifest("com.example", None, true);
        // string_count of the pool chunk that follows the document header
        bytes[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = BinaryManifest::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ManifestError::Malformed(_)), "{}", err);
    }

    #[test]
    fn rejects_non_xml_input() {
        assert!(BinaryManifest::from_bytes(b"PK\x03\x04junkjunk").is_err());
        assert!(BinaryManifest::from_bytes(&[]).is_err());
    }
}
