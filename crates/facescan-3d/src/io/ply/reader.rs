use std::io::BufRead;
use std::path::Path;

use super::PlyError;
use crate::frame::ChannelOrder;
use crate::pointcloud::PointCloud;

// upper bound on the vertices reserved from the header count
const MAX_PREALLOCATED_VERTICES: usize = 1 << 20;

struct PlyHeader {
    vertex_count: usize,
    properties: Vec<String>,
    // number of header lines, to report vertex line numbers
    num_lines: usize,
}

impl PlyHeader {
    fn position(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p == name)
    }
}

fn parse_header<R: BufRead>(reader: &mut R) -> Result<PlyHeader, PlyError> {
    let mut line = String::new();
    let mut num_lines = 0;
    let mut vertex_count = None;
    let mut in_vertex_element = false;
    let mut properties = Vec::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(PlyError::InvalidHeader("missing end_header".to_string()));
        }
        num_lines += 1;
        let trimmed = line.trim();

        if num_lines == 1 {
            if trimmed != "ply" {
                return Err(PlyError::InvalidHeader("missing ply magic".to_string()));
            }
            continue;
        }

        if trimmed == "end_header" {
            break;
        }

        let parts = trimmed.split_whitespace().collect::<Vec<_>>();
        match parts.as_slice() {
            ["format", "ascii", _] => {}
            ["format", other, ..] => return Err(PlyError::UnsupportedFormat(other.to_string())),
            ["comment", ..] | ["obj_info", ..] | [] => {}
            ["element", "vertex", count] => {
                if vertex_count.is_some() {
                    return Err(PlyError::InvalidHeader(
                        "duplicate vertex element".to_string(),
                    ));
                }
                vertex_count = Some(count.parse::<usize>().map_err(|_| {
                    PlyError::InvalidHeader(format!("invalid vertex count {count}"))
                })?);
                in_vertex_element = true;
            }
            ["element", ..] => {
                // vertices come first in every file this reader produces; later elements
                // such as faces are ignored
                if vertex_count.is_none() {
                    return Err(PlyError::InvalidHeader(
                        "vertex element must come first".to_string(),
                    ));
                }
                in_vertex_element = false;
            }
            ["property", "list", ..] if in_vertex_element => {
                return Err(PlyError::InvalidHeader(
                    "list properties on vertices are not supported".to_string(),
                ));
            }
            ["property", _, name] => {
                if in_vertex_element {
                    properties.push(name.to_string());
                }
            }
            ["property", ..] => {}
            _ => {
                return Err(PlyError::InvalidHeader(format!(
                    "unexpected line {trimmed:?}"
                )))
            }
        }
    }

    let vertex_count =
        vertex_count.ok_or_else(|| PlyError::InvalidHeader("missing vertex element".to_string()))?;

    Ok(PlyHeader {
        vertex_count,
        properties,
        num_lines,
    })
}

/// Read an ASCII PLY file into an RGBA point cloud.
///
/// The vertex element must declare `x`, `y` and `z`; `red`, `green`, `blue` and `alpha`
/// are optional and default to opaque white. Normals (`nx`, `ny`, `nz`) are read when all
/// three are present.
pub fn read_ply_ascii(path: impl AsRef<Path>) -> Result<PointCloud, PlyError> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    read_ply_ascii_from(&mut reader)
}

/// Read ASCII PLY from any buffered reader.
pub fn read_ply_ascii_from<R: BufRead>(reader: &mut R) -> Result<PointCloud, PlyError> {
    let header = parse_header(reader)?;

    let xyz = [
        header.position("x").ok_or(PlyError::MissingProperty("x"))?,
        header.position("y").ok_or(PlyError::MissingProperty("y"))?,
        header.position("z").ok_or(PlyError::MissingProperty("z"))?,
    ];
    let rgba = ["red", "green", "blue", "alpha"].map(|name| header.position(name));
    let normal = match ["nx", "ny", "nz"].map(|name| header.position(name)) {
        [Some(nx), Some(ny), Some(nz)] => Some([nx, ny, nz]),
        _ => None,
    };

    // the declared count is untrusted until the vertices are read
    let capacity = header.vertex_count.min(MAX_PREALLOCATED_VERTICES);
    let mut cloud = PointCloud::with_capacity(capacity, ChannelOrder::Rgba);
    let mut normals = Vec::with_capacity(if normal.is_some() { capacity } else { 0 });

    let mut line = String::new();
    let mut line_number = header.num_lines;
    let mut values = Vec::with_capacity(header.properties.len());
    for found in 0..header.vertex_count {
        line.clear();
        line_number += 1;
        if reader.read_line(&mut line)? == 0 {
            return Err(PlyError::UnexpectedEof {
                expected: header.vertex_count,
                found,
            });
        }

        values.clear();
        for token in line.split_whitespace() {
            let value = token.parse::<f64>().map_err(|_| PlyError::InvalidVertex {
                line: line_number,
                reason: format!("cannot parse {token:?}"),
            })?;
            values.push(value);
        }
        if values.len() != header.properties.len() {
            return Err(PlyError::InvalidVertex {
                line: line_number,
                reason: format!(
                    "expected {} values, found {}",
                    header.properties.len(),
                    values.len()
                ),
            });
        }

        let position = xyz.map(|i| values[i]);
        let color = rgba.map(|i| match i {
            Some(i) => values[i].clamp(0.0, 255.0) as u8,
            None => 255,
        });
        cloud.push(position, color);
        if let Some(normal) = normal {
            normals.push(normal.map(|i| values[i]));
        }
    }

    if normal.is_some() {
        cloud
            .set_normals(normals)
            .map_err(|err| PlyError::InvalidHeader(err.to_string()))?;
    }

    Ok(cloud)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ply::write_ply_ascii;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_header_basic() -> Result<(), PlyError> {
        let header_text = "ply\nformat ascii 1.0\ncomment made by hand\nelement vertex 10\nproperty float x\nproperty float y\nproperty float z\nelement face 2\nproperty list uchar int vertex_indices\nend_header\n";
        let mut reader = std::io::BufReader::new(header_text.as_bytes());
        let header = parse_header(&mut reader)?;
        assert_eq!(header.vertex_count, 10);
        assert_eq!(header.properties, vec!["x", "y", "z"]);
        assert_eq!(header.num_lines, 10);
        Ok(())
    }

    #[test]
    fn test_huge_vertex_count_is_an_error() {
        let text = "ply\nformat ascii 1.0\nelement vertex 100000000000\nproperty float x\nproperty float y\nproperty float z\nend_header\n1 2 3\n";
        let mut reader = std::io::BufReader::new(text.as_bytes());
        assert!(matches!(
            read_ply_ascii_from(&mut reader),
            Err(PlyError::UnexpectedEof {
                expected: 100000000000,
                found: 1
            })
        ));
    }

    #[test]
    fn test_parse_header_rejects_binary() {
        let header_text = "ply\nformat binary_little_endian 1.0\nelement vertex 1\nproperty float x\nend_header\n";
        let mut reader = std::io::BufReader::new(header_text.as_bytes());
        assert!(matches!(
            parse_header(&mut reader),
            Err(PlyError::UnsupportedFormat(_))
        ));

        let mut reader = std::io::BufReader::new("obj\n".as_bytes());
        assert!(matches!(
            parse_header(&mut reader),
            Err(PlyError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_read_ply_ascii_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let cloud = PointCloud::new(
            vec![[1.5, -2.0, 400.25], [3.0, 4.0, 5.0]],
            vec![[10, 20, 30, 255], [0, 128, 255, 17]],
            ChannelOrder::Bgra,
        )?;
        let file = NamedTempFile::new()?;
        write_ply_ascii(file.path(), &cloud)?;

        let read = read_ply_ascii(file.path())?;
        assert_eq!(read.len(), 2);
        assert_eq!(read.channel_order(), ChannelOrder::Rgba);
        assert_eq!(read.points(), cloud.points());
        assert_eq!(read.colors()[0], [30, 20, 10, 255]);
        assert_eq!(read.colors()[1], [255, 128, 0, 17]);
        Ok(())
    }

    #[test]
    fn test_read_ply_ascii_optional_properties() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = NamedTempFile::new()?;
        write!(
            file,
            "ply\nformat ascii 1.0\nelement vertex 1\nproperty double x\nproperty double y\nproperty double z\nproperty float nx\nproperty float ny\nproperty float nz\nend_header\n1 2 3 0 0 -1\n"
        )?;
        let cloud = read_ply_ascii(file.path())?;
        assert_eq!(cloud.points()[0], [1.0, 2.0, 3.0]);
        assert_eq!(cloud.colors()[0], [255; 4]);
        assert_eq!(cloud.normals().map(|n| n[0]), Some([0.0, 0.0, -1.0]));
        Ok(())
    }

    #[test]
    fn test_read_ply_ascii_truncated() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = NamedTempFile::new()?;
        write!(
            file,
            "ply\nformat ascii 1.0\nelement vertex 3\nproperty float x\nproperty float y\nproperty float z\nend_header\n1 2 3\n4 5\n"
        )?;
        match read_ply_ascii(file.path()) {
            Err(PlyError::InvalidVertex { line, .. }) => assert_eq!(line, 9),
            other => panic!("unexpected result {other:?}"),
        }

        let mut file = NamedTempFile::new()?;
        write!(
            file,
            "ply\nformat ascii 1.0\nelement vertex 3\nproperty float x\nproperty float y\nproperty float z\nend_header\n1 2 3\n"
        )?;
        assert!(matches!(
            read_ply_ascii(file.path()),
            Err(PlyError::UnexpectedEof {
                expected: 3,
                found: 1
            })
        ));

        let mut file = NamedTempFile::new()?;
        write!(
            file,
            "ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nproperty float y\nend_header\n1 2\n"
        )?;
        assert!(matches!(
            read_ply_ascii(file.path()),
            Err(PlyError::MissingProperty("z"))
        ));
        Ok(())
    }
}
