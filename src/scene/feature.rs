//! Features: the columns of every object's feature vector.

use serde::{Deserialize, Serialize};

use crate::model::FeatureId;
use crate::{Error, Result};

use super::SurfelScene;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum FeatureKind {
    #[default]
    Generic,
    /// Computed from the object's point set.
    PointSet,
    /// Sampled from an overhead raster stored in `filename`.
    OverheadGrid { filename: Option<String> },
}

impl FeatureKind {
    pub fn code(&self) -> i32 {
        match self {
            FeatureKind::Generic => 0,
            FeatureKind::PointSet => 1,
            FeatureKind::OverheadGrid { .. } => 2,
        }
    }

    pub fn from_code(code: i32, filename: Option<String>) -> Result<Self> {
        match code {
            0 => Ok(FeatureKind::Generic),
            1 => Ok(FeatureKind::PointSet),
            2 => Ok(FeatureKind::OverheadGrid { filename }),
            other => Err(Error::Format(format!("unknown feature type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfelFeature {
    pub name: Option<String>,
    pub minimum: f64,
    pub maximum: f64,
    pub weight: f64,
    pub kind: FeatureKind,
}

impl Default for SurfelFeature {
    fn default() -> Self {
        Self { name: None, minimum: 0.0, maximum: 0.0, weight: 1.0, kind: FeatureKind::Generic }
    }
}

impl SurfelFeature {
    pub fn new(name: impl Into<String>, minimum: f64, maximum: f64) -> Self {
        Self { name: Some(name.into()), minimum, maximum, ..Self::default() }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_kind(mut self, kind: FeatureKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl SurfelScene {
    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    pub fn feature(&self, id: FeatureId) -> Result<&SurfelFeature> {
        self.features.try_get(id)
    }

    pub fn feature_at(&self, index: usize) -> Option<FeatureId> {
        self.features.handle_at(index)
    }

    pub fn feature_index(&self, id: FeatureId) -> Option<usize> {
        self.features.index_of(id)
    }

    pub fn features(&self) -> impl Iterator<Item = (FeatureId, &SurfelFeature)> + '_ {
        self.features.iter()
    }

    pub fn find_feature_by_name(&self, name: &str) -> Option<FeatureId> {
        self.features.iter().find(|(_, f)| f.name() == Some(name)).map(|(id, _)| id)
    }

    /// Append a feature. Every object gains a zero slot at the end of its
    /// vector.
    pub fn insert_feature(&mut self, feature: SurfelFeature) -> FeatureId {
        let width = self.features.len();
        for (_, object) in self.objects.iter_mut() {
            object.feature_vector.resize(width + 1, 0.0);
        }
        self.dirty = true;
        self.features.insert(feature)
    }

    /// Remove a feature. In every vector the last slot moves into the
    /// removed one, mirroring how the feature list itself is compacted.
    pub fn remove_feature(&mut self, id: FeatureId) -> Result<SurfelFeature> {
        let index = self.features.index_of(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        let last = self.features.len() - 1;
        for (_, object) in self.objects.iter_mut() {
            if object.feature_vector.len() > last {
                object.feature_vector.swap(index, last);
                object.feature_vector.truncate(last);
            }
        }
        self.dirty = true;
        self.features.remove(id).ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Feature value of `object` by feature handle.
    pub fn feature_value(&self, object: crate::model::ObjectId, feature: FeatureId) -> Result<f64> {
        let index = self.features.index_of(feature).ok_or_else(|| Error::NotFound(feature.to_string()))?;
        Ok(self.objects.try_get(object)?.feature_vector.get(index).copied().unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SurfelObject;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_feature_slots_follow_feature_list() {
        let mut scene = SurfelScene::new();
        let root = scene.root_object();
        let pole = scene.insert_object(SurfelObject::named("pole"), root).unwrap();
        let height = scene.insert_feature(SurfelFeature::new("height", 0.0, 10.0));
        let width = scene.insert_feature(SurfelFeature::new("width", 0.0, 2.0));
        let depth = scene.insert_feature(SurfelFeature::new("depth", 0.0, 2.0));
        scene.set_feature_vector(pole, vec![7.0, 0.3, 0.4]).unwrap();

        scene.remove_feature(height).unwrap();
        assert_eq!(scene.feature_index(depth), Some(0));
        assert_eq!(scene.feature_index(width), Some(1));
        assert_eq!(scene.object(pole).unwrap().feature_vector(), &[0.4, 0.3]);
        assert_eq!(scene.feature_value(pole, width).unwrap(), 0.3);
    }

    #[test]
    fn test_new_objects_get_full_width_vectors() {
        let mut scene = SurfelScene::new();
        scene.insert_feature(SurfelFeature::new("a", 0.0, 1.0));
        scene.insert_feature(SurfelFeature::new("b", 0.0, 1.0));
        let root = scene.root_object();
        let o = scene.insert_object(SurfelObject::new(), root).unwrap();
        assert_eq!(scene.object(o).unwrap().feature_vector().len(), 2);
        assert!(scene.set_feature_vector(o, vec![1.0]).is_err());
    }

    #[test]
    fn test_feature_kind_codes() {
        let grid = FeatureKind::from_code(2, Some("dem.grd".into())).unwrap();
        assert_eq!(grid.code(), 2);
        assert!(FeatureKind::from_code(9, None).is_err());
    }
}
