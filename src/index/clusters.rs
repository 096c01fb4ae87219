// Periodic full face re-cluster.
//
// HDBSCAN over every stored face embedding, L2-normalised so Euclidean
// distance approximates cosine on the unit sphere. The whole cluster table is
// rebuilt from the labelling: assignments, centroids, representatives,
// per-cluster video counts.

use std::collections::HashMap;

use hdbscan::{Hdbscan, HdbscanHyperParams};
use rusqlite::Connection;

use crate::db::schema;
use crate::error::{OtError, Result};
use crate::vector::{decode_blob, dot, encode_blob, l2_normalize};

/// Run HDBSCAN over all face embeddings and rebuild the cluster table.
/// Returns (clusters, noise points).
pub fn run_full_clustering(conn: &Connection, min_cluster_size: usize) -> Result<(usize, usize)> {
    log::info!("Starting full face re-clustering...");

    let faces = schema::all_face_embeddings(conn)?;
    if faces.len() < min_cluster_size {
        log::info!(
            "Only {} faces - need at least {} for clustering",
            faces.len(),
            min_cluster_size
        );
        return Ok((0, faces.len()));
    }

    let face_ids: Vec<i64> = faces.iter().map(|(id, _)| *id).collect();
    let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(faces.len());
    for (_, blob) in &faces {
        let mut v = decode_blob(blob)?;
        l2_normalize(&mut v);
        embeddings.push(v);
    }

    log::info!("Clustering {} face embeddings...", embeddings.len());

    let params = HdbscanHyperParams::builder()
        .min_cluster_size(min_cluster_size)
        .build();
    let clusterer = Hdbscan::new(&embeddings, params);
    let labels = clusterer
        .cluster()
        .map_err(|e| OtError::Internal(format!("HDBSCAN failed: {:?}", e)))?;

    let num_noise = labels.iter().filter(|&&l| l == -1).count();
    let mut members: HashMap<i32, Vec<usize>> = HashMap::new();
    for (idx, &label) in labels.iter().enumerate() {
        if label >= 0 {
            members.entry(label).or_default().push(idx);
        }
    }
    let num_clusters = members.len();
    log::info!(
        "HDBSCAN found {} clusters, {} noise points",
        num_clusters,
        num_noise
    );

    // Rebuild from scratch: clear every assignment and cluster row
    schema::clear_all_face_clusters(conn)?;

    for (idx, &label) in labels.iter().enumerate() {
        if label >= 0 {
            schema::set_face_cluster(conn, face_ids[idx], Some(label as i64))?;
        }
    }

    for (label, idxs) in &members {
        let centroid = cluster_centroid(&embeddings, idxs);

        // Representative face: the member closest to the centroid
        let representative_idx = idxs
            .iter()
            .copied()
            .max_by(|&a, &b| {
                dot(&embeddings[a], &centroid)
                    .partial_cmp(&dot(&embeddings[b], &centroid))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("cluster has members");

        let video_count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT video_id) FROM face_detections WHERE cluster_id = ?1",
            [*label as i64],
            |row| row.get(0),
        )?;

        schema::insert_face_cluster(
            conn,
            *label as i64,
            idxs.len() as i64,
            video_count,
            &encode_blob(&centroid),
            face_ids[representative_idx],
        )?;
    }

    log::info!(
        "Full re-clustering complete: {} clusters, {} noise",
        num_clusters,
        num_noise
    );
    Ok((num_clusters, num_noise))
}

/// L2-normalised mean of the member embeddings.
fn cluster_centroid(embeddings: &[Vec<f32>], member_idxs: &[usize]) -> Vec<f32> {
    let dim = embeddings[member_idxs[0]].len();
    let mut centroid = vec![0.0f32; dim];
    for &idx in member_idxs {
        for (c, x) in centroid.iter_mut().zip(embeddings[idx].iter()) {
            *c += x;
        }
    }
    let n = member_idxs.len() as f32;
    for c in centroid.iter_mut() {
        *c /= n;
    }
    l2_normalize(&mut centroid);
    centroid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Standard normal via Box-Muller.
    fn gaussian(rng: &mut StdRng) -> f32 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
    }

    fn synthetic_face(center: &[f32], rng: &mut StdRng, sigma: f32) -> Vec<f32> {
        let mut v: Vec<f32> = center
            .iter()
            .map(|c| c + sigma * gaussian(rng))
            .collect();
        l2_normalize(&mut v);
        v
    }

    #[test]
    fn test_three_tight_clusters_recovered() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let mut rng = StdRng::seed_from_u64(7);

        // Three well-separated unit-sphere centres in 512-d
        let mut centers: Vec<Vec<f32>> = Vec::new();
        for c in 0..3 {
            let mut center = vec![0.0f32; 512];
            center[c * 100] = 1.0;
            center[c * 100 + 1] = 0.5;
            l2_normalize(&mut center);
            centers.push(center);
        }

        // 20 tight samples per centre
        for center in &centers {
            for _ in 0..20 {
                let v = synthetic_face(center, &mut rng, 0.01);
                schema::insert_face_detection(
                    &conn,
                    "vid-1",
                    0,
                    0,
                    (0, 0, 50, 50),
                    0.9,
                    &encode_blob(&v),
                    None,
                )
                .unwrap();
            }
        }

        let (clusters, noise) = run_full_clustering(&conn, 5).unwrap();
        assert_eq!(clusters, 3);
        assert_eq!(noise, 0);

        // Each rebuilt centroid lies within cosine distance 0.1 of a
        // generator centre
        let stored = schema::cluster_centroids(&conn).unwrap();
        assert_eq!(stored.len(), 3);
        for (_, blob) in stored {
            let centroid = decode_blob(&blob).unwrap();
            let best = centers
                .iter()
                .map(|c| dot(c, &centroid))
                .fold(f32::MIN, f32::max);
            assert!(1.0 - best < 0.1, "centroid drifted: cos sim {}", best);
        }

        // Counts line up
        let listed = schema::list_face_clusters(&conn).unwrap();
        assert!(listed.iter().all(|c| c.face_count == 20));
        assert!(listed.iter().all(|c| c.video_count == 1));
        assert!(listed.iter().all(|c| c.representative_face_id.is_some()));
    }

    #[test]
    fn test_too_few_faces_skips_clustering() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let mut v = vec![0.0f32; 512];
        v[0] = 1.0;
        schema::insert_face_detection(&conn, "v", 0, 0, (0, 0, 50, 50), 0.9, &encode_blob(&v), None)
            .unwrap();

        let (clusters, noise) = run_full_clustering(&conn, 5).unwrap();
        assert_eq!(clusters, 0);
        assert_eq!(noise, 1);
    }

    #[test]
    fn test_recluster_replaces_previous_assignments() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let mut rng = StdRng::seed_from_u64(11);
        let mut center = vec![0.0f32; 512];
        center[0] = 1.0;
        for _ in 0..10 {
            let v = synthetic_face(&center, &mut rng, 0.01);
            schema::insert_face_detection(
                &conn,
                "v",
                0,
                0,
                (0, 0, 50, 50),
                0.9,
                &encode_blob(&v),
                None,
            )
            .unwrap();
        }

        run_full_clustering(&conn, 5).unwrap();
        let first = schema::list_face_clusters(&conn).unwrap();
        run_full_clustering(&conn, 5).unwrap();
        let second = schema::list_face_clusters(&conn).unwrap();

        // Stable rebuild, no duplicated cluster rows
        assert_eq!(first.len(), second.len());
    }
}
