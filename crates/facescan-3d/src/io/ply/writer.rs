use std::io::{BufWriter, Write};
use std::path::Path;

use super::PlyError;
use crate::pointcloud::PointCloud;

/// Write the cloud as an ASCII PLY file with `x y z red green blue alpha` vertices.
///
/// Colors are always written in RGBA order whatever the cloud's channel order. Positions
/// are written as 32-bit floats, matching the `property float` declarations.
pub fn write_ply_ascii(path: impl AsRef<Path>, cloud: &PointCloud) -> Result<(), PlyError> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_ply_ascii_to(&mut writer, cloud)?;
    writer.flush()?;
    Ok(())
}

/// Write the cloud as ASCII PLY to any writer.
pub fn write_ply_ascii_to<W: Write>(writer: &mut W, cloud: &PointCloud) -> Result<(), PlyError> {
    write!(
        writer,
        "ply\n\
         format ascii 1.0\n\
         element vertex {}\n\
         property float x\n\
         property float y\n\
         property float z\n\
         property uchar red\n\
         property uchar green\n\
         property uchar blue\n\
         property uchar alpha\n\
         end_header\n",
        cloud.len()
    )?;

    for (point, [r, g, b, a]) in cloud.points().iter().zip(cloud.rgba()) {
        writeln!(
            writer,
            "{} {} {} {r} {g} {b} {a}",
            point[0] as f32, point[1] as f32, point[2] as f32
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ChannelOrder;

    #[test]
    fn test_exact_header_and_rgba_order() -> Result<(), Box<dyn std::error::Error>> {
        let cloud = PointCloud::new(
            vec![[1.5, -2.0, 400.25], [0.0, 0.0, 1.0]],
            vec![[10, 20, 30, 255], [1, 2, 3, 4]],
            ChannelOrder::Bgra,
        )?;
        let mut buffer = Vec::new();
        write_ply_ascii_to(&mut buffer, &cloud)?;

        let expected = "ply\n\
                        format ascii 1.0\n\
                        element vertex 2\n\
                        property float x\n\
                        property float y\n\
                        property float z\n\
                        property uchar red\n\
                        property uchar green\n\
                        property uchar blue\n\
                        property uchar alpha\n\
                        end_header\n\
                        1.5 -2 400.25 30 20 10 255\n\
                        0 0 1 3 2 1 4\n";
        assert_eq!(String::from_utf8(buffer)?, expected);
        Ok(())
    }

    #[test]
    fn test_empty_cloud() -> Result<(), Box<dyn std::error::Error>> {
        let mut buffer = Vec::new();
        write_ply_ascii_to(&mut buffer, &PointCloud::default())?;
        let text = String::from_utf8(buffer)?;
        assert!(text.contains("element vertex 0\n"));
        assert!(text.ends_with("end_header\n"));
        Ok(())
    }

    #[test]
    fn test_unwritable_destination() {
        let result = write_ply_ascii("/nonexistent/dir/cloud.ply", &PointCloud::default());
        assert!(matches!(result, Err(PlyError::Io(_))));
    }
}
