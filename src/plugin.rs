use crate::{math::PerspectiveCamera, terrain_data::quadtree::QuadTreeEngine};
use bevy::prelude::*;

/// The view every [`QuadTreeEngine`] is refined for.
///
/// Only a single viewer is supported, additional viewers are ignored.
#[derive(Component, Clone, Debug, Default)]
pub struct TerrainViewer {
    pub camera: PerspectiveCamera,
}

/// Sent whenever the leaves of a terrain changed, so that their meshes can be rebuilt.
#[derive(Event, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerrainChanged {
    pub terrain: Entity,
}

/// Updates the quadtree of every terrain entity once per frame.
pub struct TerrainStreamingPlugin;

impl Plugin for TerrainStreamingPlugin {
    fn build(&self, app: &mut App) {
        app.add_event::<TerrainChanged>()
            .add_systems(Last, update_terrains);
    }
}

pub fn update_terrains(
    viewers: Query<&TerrainViewer>,
    mut terrains: Query<(Entity, &mut QuadTreeEngine)>,
    mut changed: EventWriter<TerrainChanged>,
) {
    let Some(viewer) = viewers.iter().next() else {
        return;
    };

    for (terrain, mut engine) in &mut terrains {
        match engine.update(&viewer.camera) {
            Ok(true) => {
                changed.send(TerrainChanged { terrain });
            }
            Ok(false) => {}
            Err(error) => error!("Failed to update terrain {}: {error:#}", engine.tree_id()),
        }
    }
}
