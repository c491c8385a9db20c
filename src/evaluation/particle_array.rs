use crate::{
    error::EvalError,
    floating_type_mod::FT,
    thread_safe_ptr::{ThreadSafeConstPtr, ThreadSafeMutPtr},
    vec3f, V3,
};

/// Properties every particle array carries from construction on.
pub const DEFAULT_PROPERTIES: [&str; 13] = ["x", "y", "z", "u", "v", "w", "m", "h", "rho", "p", "au", "av", "aw"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ParticleTag {
    Local = 0,
    Remote = 1,
    Ghost = 2,
}

#[derive(Debug, Clone)]
struct NamedArray {
    name: String,
    values: Vec<FT>,
}

/// Named collection of particles with a fixed set of scalar property arrays.
///
/// Property arrays, `tag`, `pid` and `gid` always have one entry per particle.
/// The first `num_real_particles` particles are the active ones, the rest are
/// ghost or remote copies.
#[derive(Debug, Clone)]
pub struct ParticleArray {
    name: String,
    properties: Vec<NamedArray>,
    constants: Vec<NamedArray>,
    tag: Vec<i32>,
    pid: Vec<i32>,
    gid: Vec<u32>,
    num_real_particles: usize,
}

impl ParticleArray {
    pub fn new(name: impl Into<String>, num_particles: usize) -> Self {
        ParticleArray {
            name: name.into(),
            properties: DEFAULT_PROPERTIES
                .iter()
                .map(|&name| NamedArray {
                    name: name.to_string(),
                    values: vec![0.; num_particles],
                })
                .collect(),
            constants: Vec::new(),
            tag: vec![ParticleTag::Local as i32; num_particles],
            pid: vec![0; num_particles],
            gid: (0..num_particles as u32).collect(),
            num_real_particles: num_particles,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_particles(&self) -> usize {
        self.tag.len()
    }

    pub fn num_real_particles(&self) -> usize {
        self.num_real_particles
    }

    pub fn set_num_real_particles(&mut self, num_real_particles: usize) {
        self.num_real_particles = num_real_particles;
    }

    /** Replaces the values of `name`, adding the property if it does not exist yet. */
    pub fn set_property(&mut self, name: &str, values: Vec<FT>) {
        match self.properties.iter_mut().find(|p| p.name == name) {
            Some(property) => property.values = values,
            None => self.properties.push(NamedArray {
                name: name.to_string(),
                values,
            }),
        }
    }

    pub fn with_property(mut self, name: &str, values: Vec<FT>) -> Self {
        self.set_property(name, values);
        self
    }

    /** Adds `name` filled with `default`; existing properties are left untouched. */
    pub fn add_property(&mut self, name: &str, default: FT) {
        if !self.has_property(name) {
            let len = self.num_particles();
            self.set_property(name, vec![default; len]);
        }
    }

    pub fn set_constant(&mut self, name: &str, values: Vec<FT>) {
        match self.constants.iter_mut().find(|c| c.name == name) {
            Some(constant) => constant.values = values,
            None => self.constants.push(NamedArray {
                name: name.to_string(),
                values,
            }),
        }
    }

    pub fn with_constant(mut self, name: &str, values: Vec<FT>) -> Self {
        self.set_constant(name, values);
        self
    }

    pub fn with_tags(mut self, tag: Vec<i32>) -> Self {
        self.tag = tag;
        self
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p.name == name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.name.as_str())
    }

    pub fn constant_names(&self) -> impl Iterator<Item = &str> {
        self.constants.iter().map(|c| c.name.as_str())
    }

    pub fn property(&self, name: &str) -> Option<&[FT]> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.values.as_slice())
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut [FT]> {
        self.properties
            .iter_mut()
            .find(|p| p.name == name)
            .map(|p| p.values.as_mut_slice())
    }

    pub fn constant(&self, name: &str) -> Option<&[FT]> {
        self.constants
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    pub fn constant_mut(&mut self, name: &str) -> Option<&mut [FT]> {
        self.constants
            .iter_mut()
            .find(|c| c.name == name)
            .map(|c| c.values.as_mut_slice())
    }

    pub fn tag(&self) -> &[i32] {
        &self.tag
    }

    pub fn pid(&self) -> &[i32] {
        &self.pid
    }

    pub fn gid(&self) -> &[u32] {
        &self.gid
    }

    pub fn position(&self, i: usize) -> Option<V3> {
        let x = self.property("x")?;
        let y = self.property("y")?;
        let z = self.property("z")?;
        Some(vec3f(x[i], y[i], z[i]))
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        let num_all = self.num_particles();

        for (i, property) in self.properties.iter().enumerate() {
            if self.properties[..i].iter().any(|p| p.name == property.name) {
                return Err(EvalError::DuplicateProperty {
                    array: self.name.clone(),
                    property: property.name.clone(),
                });
            }
            self.check_len(&property.name, property.values.len())?;
        }

        for (i, constant) in self.constants.iter().enumerate() {
            if self.constants[..i].iter().any(|c| c.name == constant.name) {
                return Err(EvalError::DuplicateProperty {
                    array: self.name.clone(),
                    property: constant.name.clone(),
                });
            }
        }

        self.check_len("pid", self.pid.len())?;
        self.check_len("gid", self.gid.len())?;

        if self.num_real_particles > num_all {
            return Err(EvalError::RealCountExceedsTotal {
                array: self.name.clone(),
                num_real: self.num_real_particles,
                num_all,
            });
        }

        Ok(())
    }

    fn check_len(&self, property: &str, got: usize) -> Result<(), EvalError> {
        let expected = self.num_particles();
        if got != expected {
            return Err(EvalError::LengthMismatch {
                array: self.name.clone(),
                property: property.to_string(),
                expected,
                got,
            });
        }
        Ok(())
    }

    pub fn swap(&mut self, i: usize, j: usize) {
        for property in &mut self.properties {
            property.values.swap(i, j);
        }
        self.tag.swap(i, j);
        self.pid.swap(i, j);
        self.gid.swap(i, j);
    }

    /// Moves all local particles in front of remote and ghost particles
    /// (keeping the relative order within both parts) and sets the real count
    /// to the number of local particles.
    pub fn align_particles(&mut self) {
        let local = ParticleTag::Local as i32;
        let order: Vec<usize> = (0..self.num_particles())
            .filter(|&i| self.tag[i] == local)
            .chain((0..self.num_particles()).filter(|&i| self.tag[i] != local))
            .collect();

        fn permute<T: Copy>(values: &[T], order: &[usize]) -> Vec<T> {
            order.iter().map(|&i| values[i]).collect()
        }

        for property in &mut self.properties {
            property.values = permute(&property.values, &order);
        }
        self.tag = permute(&self.tag, &order);
        self.pid = permute(&self.pid, &order);
        self.gid = permute(&self.gid, &order);
        self.num_real_particles = self.tag.iter().filter(|&&t| t == local).count();
    }
}

pub type PropertyId = usize;

#[derive(Debug, Clone, Copy)]
struct GeometryIds {
    x: PropertyId,
    y: PropertyId,
    z: PropertyId,
    u: PropertyId,
    v: PropertyId,
    w: PropertyId,
    h: PropertyId,
}

/// Handle to the storage of one [`ParticleArray`] used inside the particle
/// loops.
///
/// Property ids are positions in the view's schema. They never change for the
/// lifetime of the view: `rebind` matches properties by name and only appends
/// names that are new.
pub struct ParticleArrayView {
    index: usize,
    name: String,
    property_names: Vec<String>,
    properties: Vec<ThreadSafeMutPtr<FT>>,
    constant_names: Vec<String>,
    constants: Vec<(ThreadSafeMutPtr<FT>, usize)>,
    tag: ThreadSafeConstPtr<i32>,
    pid: ThreadSafeConstPtr<i32>,
    gid: ThreadSafeConstPtr<u32>,
    num_real_particles: usize,
    num_particles: usize,
    geometry: GeometryIds,
}

impl ParticleArrayView {
    pub fn new(index: usize, array: &mut ParticleArray) -> Result<Self, EvalError> {
        array.validate()?;

        let mut view = ParticleArrayView {
            index,
            name: array.name().to_string(),
            property_names: array.property_names().map(String::from).collect(),
            properties: Vec::new(),
            constant_names: array.constant_names().map(String::from).collect(),
            constants: Vec::new(),
            tag: ThreadSafeConstPtr::null(),
            pid: ThreadSafeConstPtr::null(),
            gid: ThreadSafeConstPtr::null(),
            num_real_particles: 0,
            num_particles: 0,
            geometry: GeometryIds {
                x: 0,
                y: 0,
                z: 0,
                u: 0,
                v: 0,
                w: 0,
                h: 0,
            },
        };

        view.geometry = GeometryIds {
            x: view.property_id("x")?,
            y: view.property_id("y")?,
            z: view.property_id("z")?,
            u: view.property_id("u")?,
            v: view.property_id("v")?,
            w: view.property_id("w")?,
            h: view.property_id("h")?,
        };

        view.attach(array)?;
        Ok(view)
    }

    /// Checks that `array` can replace the storage behind this view.
    pub fn check_compatible(&self, array: &ParticleArray) -> Result<(), EvalError> {
        array.validate()?;
        if let Some(missing) = self.property_names.iter().find(|name| !array.has_property(name)) {
            return Err(EvalError::MissingProperty {
                array: array.name().to_string(),
                property: missing.clone(),
            });
        }
        if let Some(missing) = self
            .constant_names
            .iter()
            .find(|name| array.constant(name).is_none())
        {
            return Err(EvalError::MissingConstant {
                array: array.name().to_string(),
                constant: missing.clone(),
            });
        }
        Ok(())
    }

    /// Re-attaches all handles to the (possibly replaced) storage of `array`.
    pub fn rebind(&mut self, array: &mut ParticleArray) -> Result<(), EvalError> {
        self.check_compatible(array)?;

        for name in array.property_names() {
            if !self.property_names.iter().any(|n| n == name) {
                self.property_names.push(name.to_string());
            }
        }
        for name in array.constant_names() {
            if !self.constant_names.iter().any(|n| n == name) {
                self.constant_names.push(name.to_string());
            }
        }

        self.attach(array)
    }

    fn attach(&mut self, array: &mut ParticleArray) -> Result<(), EvalError> {
        let mut properties = Vec::with_capacity(self.property_names.len());
        for name in &self.property_names {
            let values = array.property_mut(name).ok_or_else(|| EvalError::MissingProperty {
                array: self.name.clone(),
                property: name.clone(),
            })?;
            properties.push(ThreadSafeMutPtr::new(values.as_mut_ptr()));
        }

        let mut constants = Vec::with_capacity(self.constant_names.len());
        for name in &self.constant_names {
            let values = array.constant_mut(name).ok_or_else(|| EvalError::MissingConstant {
                array: self.name.clone(),
                constant: name.clone(),
            })?;
            constants.push((ThreadSafeMutPtr::new(values.as_mut_ptr()), values.len()));
        }

        self.properties = properties;
        self.constants = constants;
        self.tag = ThreadSafeConstPtr::new(array.tag.as_ptr());
        self.pid = ThreadSafeConstPtr::new(array.pid.as_ptr());
        self.gid = ThreadSafeConstPtr::new(array.gid.as_ptr());
        self.num_real_particles = array.num_real_particles();
        self.num_particles = array.num_particles();
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of real particles if `real` is set, of all particles otherwise.
    pub fn size(&self, real: bool) -> usize {
        if real {
            self.num_real_particles
        } else {
            self.num_particles
        }
    }

    pub fn property_names(&self) -> &[String] {
        &self.property_names
    }

    pub fn property_id(&self, name: &str) -> Result<PropertyId, EvalError> {
        self.property_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| EvalError::MissingProperty {
                array: self.name.clone(),
                property: name.to_string(),
            })
    }

    pub fn constant_id(&self, name: &str) -> Result<usize, EvalError> {
        self.constant_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| EvalError::MissingConstant {
                array: self.name.clone(),
                constant: name.to_string(),
            })
    }

    #[inline(always)]
    pub(crate) fn get(&self, property: PropertyId, i: usize) -> FT {
        assert!(i < self.num_particles);
        unsafe { self.properties[property].read(i) }
    }

    #[inline(always)]
    pub(crate) fn set(&self, property: PropertyId, i: usize, value: FT) {
        assert!(i < self.num_particles);
        unsafe { self.properties[property].write(i, value) }
    }

    #[inline(always)]
    pub(crate) fn constant_len(&self, constant: usize) -> usize {
        self.constants[constant].1
    }

    #[inline(always)]
    pub(crate) fn get_constant(&self, constant: usize, i: usize) -> FT {
        let (ptr, len) = self.constants[constant];
        assert!(i < len);
        unsafe { ptr.read(i) }
    }

    #[inline(always)]
    pub(crate) fn set_constant(&self, constant: usize, i: usize, value: FT) {
        let (ptr, len) = self.constants[constant];
        assert!(i < len);
        unsafe { ptr.write(i, value) }
    }

    #[inline(always)]
    pub fn tag(&self, i: usize) -> i32 {
        assert!(i < self.num_particles);
        unsafe { self.tag.read(i) }
    }

    #[inline(always)]
    pub fn pid(&self, i: usize) -> i32 {
        assert!(i < self.num_particles);
        unsafe { self.pid.read(i) }
    }

    #[inline(always)]
    pub fn gid(&self, i: usize) -> u32 {
        assert!(i < self.num_particles);
        unsafe { self.gid.read(i) }
    }

    #[inline(always)]
    pub fn position(&self, i: usize) -> V3 {
        vec3f(
            self.get(self.geometry.x, i),
            self.get(self.geometry.y, i),
            self.get(self.geometry.z, i),
        )
    }

    #[inline(always)]
    pub fn velocity(&self, i: usize) -> V3 {
        vec3f(
            self.get(self.geometry.u, i),
            self.get(self.geometry.v, i),
            self.get(self.geometry.w, i),
        )
    }

    #[inline(always)]
    pub fn smoothing_length(&self, i: usize) -> FT {
        self.get(self.geometry.h, i)
    }
}

#[cfg(test)]
fn ghosted_array(name: &str, num_real: usize, num_ghost: usize) -> ParticleArray {
    let n = num_real + num_ghost;
    let tags = (0..n)
        .map(|i| {
            if i < num_real {
                ParticleTag::Local as i32
            } else {
                ParticleTag::Ghost as i32
            }
        })
        .collect();
    let mut array = ParticleArray::new(name, n).with_tags(tags);
    array.set_num_real_particles(num_real);
    array
}

#[test]
fn view_size_real_never_exceeds_all() {
    for (num_real, num_ghost) in [(0, 0), (5, 0), (0, 3), (7, 4)] {
        let mut array = ghosted_array("fluid", num_real, num_ghost);
        let view = ParticleArrayView::new(0, &mut array).unwrap();
        assert!(view.size(true) <= view.size(false));
        assert_eq!(view.size(true), num_real);
        assert_eq!(view.size(false), num_real + num_ghost);
    }
}

#[test]
fn rebind_reflects_new_array_and_keeps_property_ids() {
    let mut array = ParticleArray::new("fluid", 4).with_property("V", vec![1., 2., 3., 4.]);
    let mut view = ParticleArrayView::new(3, &mut array).unwrap();
    let volume = view.property_id("V").unwrap();
    let rho = view.property_id("rho").unwrap();

    // replacement lists its properties in a different order and adds one
    let mut replacement = ghosted_array("fluid", 6, 2)
        .with_property("extra", vec![0.; 8])
        .with_property("V", (0..8).map(|i| i as FT * 10.).collect());
    view.rebind(&mut replacement).unwrap();

    assert_eq!(view.index(), 3);
    assert_eq!(view.size(true), 6);
    assert_eq!(view.size(false), 8);
    assert_eq!(view.property_id("V").unwrap(), volume);
    assert_eq!(view.property_id("rho").unwrap(), rho);
    assert!(view.property_id("extra").is_ok());
    assert_eq!(view.get(volume, 7), 70.);

    view.set(rho, 5, 2.5);
    assert_eq!(replacement.property("rho").unwrap()[5], 2.5);
}

#[test]
fn rebind_rejects_array_without_bound_property() {
    let mut array = ParticleArray::new("fluid", 2).with_property("V", vec![1., 1.]);
    let mut view = ParticleArrayView::new(0, &mut array).unwrap();
    let mut replacement = ParticleArray::new("fluid", 2);
    assert!(matches!(
        view.rebind(&mut replacement),
        Err(EvalError::MissingProperty { .. })
    ));
}

#[test]
fn validate_reports_length_mismatch() {
    let array = ParticleArray::new("solid", 3).with_property("V", vec![1., 2.]);
    match array.validate() {
        Err(EvalError::LengthMismatch {
            property,
            expected,
            got,
            ..
        }) => {
            assert_eq!(property, "V");
            assert_eq!(expected, 3);
            assert_eq!(got, 2);
        }
        other => panic!("unexpected validation result {:?}", other),
    }

    let mut array = ParticleArray::new("solid", 3);
    array.set_num_real_particles(4);
    assert!(matches!(array.validate(), Err(EvalError::RealCountExceedsTotal { .. })));
}

#[test]
fn align_particles_moves_local_particles_first() {
    let ghost = ParticleTag::Ghost as i32;
    let local = ParticleTag::Local as i32;
    let mut array = ParticleArray::new("fluid", 5)
        .with_tags(vec![ghost, local, ghost, local, local])
        .with_property("x", vec![0., 1., 2., 3., 4.]);
    array.align_particles();

    assert_eq!(array.num_real_particles(), 3);
    assert_eq!(array.tag(), &[local, local, local, ghost, ghost]);
    assert_eq!(array.property("x").unwrap(), &[1., 3., 4., 0., 2.]);
    assert_eq!(array.gid(), &[1, 3, 4, 0, 2]);
}
