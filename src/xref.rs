//! Indirect object registry.
//!
//! One slot per object number, tracking where the object's bytes live, the
//! current generation, and the in-memory value once materialized. Slot 0 is
//! the permanent head of the free list and is never handed out.
//!
//! Freed numbers are reused lowest-recently-freed first, with the generation
//! bumped on release so stale references from an earlier revision of the
//! document dangle instead of aliasing the new occupant.

use crate::object::{ObjRef, PdfObject};
use crate::reader::{LoadError, ObjectLoader};

/// Generation ceiling. A slot freed at this generation is retired for good.
pub const MAX_GENERATION: u16 = 65_535;

static NULL_OBJECT: PdfObject = PdfObject::Null;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("reference {0} {1} R is outside the registry")]
    InvalidReference(u32, u16),

    #[error("object {0} was already flushed and cannot be modified")]
    Flushed(u32),

    #[error("failed to load object {number}")]
    Load {
        number: u32,
        #[source]
        source: LoadError,
    },
}

/// Where a not-yet-materialized object's bytes live in the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// At a byte offset, as an `n g obj … endobj` body.
    Offset(u64),
    /// Member `index` of the object stream stored in object `container`.
    InStream { container: u32, index: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free {
        /// Next slot on the free list; 0 terminates the chain.
        next_free: u32,
        /// Generation the slot will carry when reallocated.
        generation: u16,
    },
    InUse {
        /// `None` for objects created in memory this session.
        location: Option<Location>,
        generation: u16,
        /// Serialized to the sink; the slot is immutable from here on.
        flushed: bool,
        /// Touched since open; drives incremental-update selection.
        modified: bool,
    },
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) state: SlotState,
    pub(crate) object: Option<PdfObject>,
}

/// The cross-reference table: registry of every indirect object the document
/// knows about, materialized lazily through an [`ObjectLoader`].
pub struct XrefTable {
    slots: Vec<Slot>,
    loader: Option<ObjectLoader>,
}

impl Default for XrefTable {
    fn default() -> Self {
        Self::new()
    }
}

impl XrefTable {
    pub fn new() -> XrefTable {
        XrefTable {
            slots: vec![Slot {
                state: SlotState::Free {
                    next_free: 0,
                    generation: MAX_GENERATION,
                },
                object: None,
            }],
            loader: None,
        }
    }

    /// Number of slots, including slot 0. This is the `/Size` of the table.
    pub fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    pub(crate) fn install_loader(&mut self, loader: ObjectLoader) {
        self.loader = Some(loader);
    }

    pub(crate) fn state(&self, number: u32) -> Option<SlotState> {
        self.slots.get(number as usize).map(|s| s.state)
    }

    /// Generation a reference to `number` must carry to resolve.
    pub fn generation_of(&self, number: u32) -> Option<u16> {
        match self.state(number)? {
            SlotState::InUse { generation, .. } => Some(generation),
            SlotState::Free { .. } => None,
        }
    }

    pub fn is_free(&self, number: u32) -> bool {
        matches!(self.state(number), Some(SlotState::Free { .. }) | None)
    }

    // ---- allocation ----

    /// Register a new object, reusing the lowest-recently-freed slot if the
    /// free list is non-empty.
    pub fn allocate(&mut self, object: PdfObject) -> ObjRef {
        let head = match self.slots[0].state {
            SlotState::Free { next_free, .. } => next_free,
            SlotState::InUse { .. } => 0,
        };
        if head != 0 && (head as usize) < self.slots.len() {
            if let SlotState::Free {
                next_free,
                generation,
            } = self.slots[head as usize].state
            {
                if let SlotState::Free {
                    next_free: ref mut list_head,
                    ..
                } = self.slots[0].state
                {
                    *list_head = next_free;
                }
                self.slots[head as usize] = Slot {
                    state: SlotState::InUse {
                        location: None,
                        generation,
                        flushed: false,
                        modified: true,
                    },
                    object: Some(object),
                };
                return ObjRef::new(head, generation);
            }
        }
        self.allocate_end(object)
    }

    /// Register a new object at the end of the table, ignoring the free
    /// list. The returned reference is always generation 0.
    pub(crate) fn allocate_end(&mut self, object: PdfObject) -> ObjRef {
        let number = self.slots.len() as u32;
        self.slots.push(Slot {
            state: SlotState::InUse {
                location: None,
                generation: 0,
                flushed: false,
                modified: true,
            },
            object: Some(object),
        });
        ObjRef::new(number, 0)
    }

    /// Release a slot onto the free list, bumping its generation for the
    /// next occupant. Freeing slot 0, an unknown slot, or an already-free
    /// slot is a no-op. A slot released at the generation ceiling is retired
    /// and never reused.
    pub fn free(&mut self, number: u32) {
        if number == 0 || number as usize >= self.slots.len() {
            return;
        }
        let generation = match self.slots[number as usize].state {
            SlotState::InUse { generation, .. } => generation,
            SlotState::Free { .. } => return,
        };
        if generation == MAX_GENERATION {
            self.slots[number as usize] = Slot {
                state: SlotState::Free {
                    next_free: 0,
                    generation: MAX_GENERATION,
                },
                object: None,
            };
            tracing::debug!(number, "object slot retired at generation ceiling");
            return;
        }
        let old_head = match self.slots[0].state {
            SlotState::Free { next_free, .. } => next_free,
            SlotState::InUse { .. } => 0,
        };
        self.slots[number as usize] = Slot {
            state: SlotState::Free {
                next_free: old_head,
                generation: generation + 1,
            },
            object: None,
        };
        if let SlotState::Free {
            next_free: ref mut head,
            ..
        } = self.slots[0].state
        {
            *head = number;
        }
    }

    // ---- resolution ----

    /// Resolve a reference to the object it names, loading from the source
    /// on first touch. Dangling references (freed slot, stale generation)
    /// resolve to null rather than failing, matching how viewers treat them.
    pub fn resolve(&mut self, r: ObjRef) -> Result<&PdfObject, ResolveError> {
        let idx = r.number() as usize;
        if r.number() == 0 || idx >= self.slots.len() {
            return Err(ResolveError::InvalidReference(r.number(), r.generation()));
        }
        match self.slots[idx].state {
            SlotState::Free { .. } => {
                tracing::warn!(reference = %r, "reference to freed object resolves to null");
                Ok(&NULL_OBJECT)
            }
            SlotState::InUse { generation, .. } if generation != r.generation() => {
                tracing::warn!(
                    reference = %r,
                    current = generation,
                    "stale generation resolves to null"
                );
                Ok(&NULL_OBJECT)
            }
            SlotState::InUse { .. } => {
                self.materialize(r.number())?;
                Ok(self.slots[idx].object.as_ref().unwrap_or(&NULL_OBJECT))
            }
        }
    }

    /// Resolve for mutation. Unlike [`resolve`](Self::resolve), dangling
    /// references and already-flushed objects are hard errors here.
    pub fn resolve_mut(&mut self, r: ObjRef) -> Result<&mut PdfObject, ResolveError> {
        let idx = r.number() as usize;
        if r.number() == 0 || idx >= self.slots.len() {
            return Err(ResolveError::InvalidReference(r.number(), r.generation()));
        }
        match self.slots[idx].state {
            SlotState::InUse {
                generation,
                flushed,
                ..
            } if generation == r.generation() => {
                if flushed {
                    return Err(ResolveError::Flushed(r.number()));
                }
                self.materialize(r.number())?;
                if let SlotState::InUse {
                    ref mut modified, ..
                } = self.slots[idx].state
                {
                    *modified = true;
                }
                self.slots[idx]
                    .object
                    .get_or_insert(PdfObject::Null);
                match self.slots[idx].object.as_mut() {
                    Some(obj) => Ok(obj),
                    None => Err(ResolveError::InvalidReference(r.number(), r.generation())),
                }
            }
            _ => Err(ResolveError::InvalidReference(r.number(), r.generation())),
        }
    }

    /// The materialized value of `number`, if it has been loaded or created.
    pub(crate) fn object(&self, number: u32) -> Option<&PdfObject> {
        self.slots.get(number as usize)?.object.as_ref()
    }

    fn materialize(&mut self, number: u32) -> Result<(), ResolveError> {
        let idx = number as usize;
        if self.slots[idx].object.is_some() {
            return Ok(());
        }
        let (location, generation) = match self.slots[idx].state {
            SlotState::InUse {
                location,
                generation,
                ..
            } => (location, generation),
            SlotState::Free { .. } => return Ok(()),
        };
        let object = match location {
            None => PdfObject::Null,
            Some(Location::Offset(offset)) => {
                let loader = self.loader.as_mut().ok_or(ResolveError::Load {
                    number,
                    source: LoadError::NoSource,
                })?;
                loader
                    .load_at(offset, ObjRef::new(number, generation))
                    .map_err(|source| ResolveError::Load { number, source })?
            }
            Some(Location::InStream { container, index }) => {
                // Containers always sit at a file offset; nesting object
                // streams inside object streams is not valid.
                let container_offset = match self.state(container) {
                    Some(SlotState::InUse {
                        location: Some(Location::Offset(offset)),
                        ..
                    }) => offset,
                    _ => {
                        return Err(ResolveError::Load {
                            number,
                            source: LoadError::BadObjectStream(container),
                        })
                    }
                };
                let loader = self.loader.as_mut().ok_or(ResolveError::Load {
                    number,
                    source: LoadError::NoSource,
                })?;
                loader
                    .load_from_container(container, container_offset, index, number)
                    .map_err(|source| ResolveError::Load { number, source })?
            }
        };
        self.slots[idx].object = Some(object);
        Ok(())
    }

    // ---- bookkeeping used by the reader and the serializer ----

    /// Remove a slot's materialized value for serialization; pair with
    /// [`restore_object`](Self::restore_object).
    pub(crate) fn take_object(&mut self, number: u32) -> Option<PdfObject> {
        self.slots.get_mut(number as usize)?.object.take()
    }

    pub(crate) fn restore_object(&mut self, number: u32, object: PdfObject) {
        if let Some(slot) = self.slots.get_mut(number as usize) {
            slot.object = Some(object);
        }
    }

    /// Grow the table to `size` slots, padding with unlinked free entries.
    pub(crate) fn grow_to(&mut self, size: u32) {
        while (self.slots.len() as u32) < size {
            self.slots.push(Slot {
                state: SlotState::Free {
                    next_free: 0,
                    generation: 0,
                },
                object: None,
            });
        }
    }

    /// Overwrite a slot's bookkeeping state, as read from a file. The caller
    /// is responsible for first-seen-wins ordering across revisions.
    pub(crate) fn set_raw(&mut self, number: u32, state: SlotState) {
        self.grow_to(number + 1);
        self.slots[number as usize].state = state;
    }

    /// Record that `number` was serialized at `location`. The slot keeps its
    /// dictionary (so reachability can still see its children) but a stream
    /// payload is dropped to bound memory.
    pub(crate) fn mark_flushed(&mut self, number: u32, location: Location) {
        let idx = number as usize;
        if idx >= self.slots.len() {
            return;
        }
        if let SlotState::InUse {
            location: ref mut slot_location,
            ref mut flushed,
            ref mut modified,
            ..
        } = self.slots[idx].state
        {
            *slot_location = Some(location);
            *flushed = true;
            *modified = false;
        }
        if let Some(PdfObject::Stream(stream)) = self.slots[idx].object.as_mut() {
            stream.discard_payload();
        }
    }

    /// Truncate trailing slots, shrinking `/Size`. Slot 0 always survives.
    pub(crate) fn truncate(&mut self, size: u32) {
        let size = size.max(1) as usize;
        if size < self.slots.len() {
            self.slots.truncate(size);
        }
    }

    /// Rebuild the free list so it links ascending slot numbers, which keeps
    /// serialized output stable regardless of the order objects were freed
    /// or dropped in.
    pub(crate) fn relink_free_list(&mut self) {
        let mut previous = 0usize;
        for idx in 1..self.slots.len() {
            let retired = matches!(
                self.slots[idx].state,
                SlotState::Free {
                    generation: MAX_GENERATION,
                    ..
                }
            );
            if retired {
                continue;
            }
            if let SlotState::Free {
                ref mut next_free, ..
            } = self.slots[idx].state
            {
                *next_free = 0;
                if let SlotState::Free {
                    next_free: ref mut prev_next,
                    ..
                } = self.slots[previous].state
                {
                    *prev_next = idx as u32;
                }
                previous = idx;
            }
        }
        if previous == 0 {
            if let SlotState::Free {
                ref mut next_free, ..
            } = self.slots[0].state
            {
                *next_free = 0;
            }
        }
    }
}
