use facescan_3d::{pointcloud::PointCloud, transforms::RigidTransform};
use facescan_icp::{evaluate_registration, IcpConfig, PairRegistration, PointToPlaneIcp};
use glam::{DMat3, DVec3};

fn face_like_grid() -> Vec<[f64; 3]> {
    let mut points = Vec::new();
    for i in 0..100 {
        for j in 0..120 {
            let x = i as f64 - 50.0;
            let y = j as f64 - 60.0;
            // a bowl with a ridge along y and a bump where a nose would be
            let z = 420.0 - 40.0 * (-(x * x) / 800.0).exp()
                - 15.0 * (-((y - 10.0) * (y - 10.0)) / 400.0).exp()
                + 0.003 * (x * x + y * y);
            points.push([x, y, z]);
        }
    }
    points
}

#[test]
fn coarse_to_fine_with_downsampling() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let target = face_like_grid();
    let dst_t_src = RigidTransform::new(
        DMat3::from_rotation_y(3f64.to_radians()),
        DVec3::new(-4.0, 2.0, 1.0),
    );
    let source = target
        .iter()
        .map(|p| dst_t_src.inverse().apply(p))
        .collect::<Vec<_>>();

    let icp = PointToPlaneIcp::new(IcpConfig::default());
    let result = icp.register_pair(
        &PointCloud::from_points(source.clone()),
        &PointCloud::from_points(target.clone()),
        &RigidTransform::IDENTITY,
    )?;

    let error = result.transform.compose(&dst_t_src.inverse());
    assert!(error.rotation_angle() < 0.5f64.to_radians(), "{error:?}");
    assert!(error.translation.length() < 1.5, "{error:?}");
    assert!(result.fitness > 0.9, "fitness {}", result.fitness);

    let (fitness, rmse) = evaluate_registration(&source, &target, &result.transform, 1.0);
    assert!(fitness > 0.9);
    assert!(rmse < 1.0);
    Ok(())
}
