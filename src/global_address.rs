//! Global addresses and the block-cyclic layout they are decomposed under.
//!
//! A [GlobalAddress] names one element somewhere in the job. It comes in two flavors:
//! - *linear*: an element index into a block-cyclic distributed allocation, consecutive blocks of
//!   `block_size` elements are dealt out to cores 0, 1, .., C-1, 0, 1, .. in turn.
//! - *two dimensional*: an explicit `(core, offset)` pair, arithmetic never leaves the core.
//!
//! All operations are pure. Handing an out of range core id to any of them is a programming error and panics.

use std::marker::PhantomData;

/// An error that occurs when an address would name a core outside of the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    CoreOutOfRange { core: usize, num_cores: usize },
    ZeroBlockSize,
    NoCores,
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AddressError::CoreOutOfRange { core, num_cores } => {
                write!(f, "core {} is out of range for a job of {} cores", core, num_cores)
            }
            AddressError::ZeroBlockSize => write!(f, "block size must be at least one element"),
            AddressError::NoCores => write!(f, "a layout needs at least one core"),
        }
    }
}

impl std::error::Error for AddressError {}

type AddressResult<T> = Result<T, AddressError>;

fn check_core(core: usize, num_cores: usize) -> AddressResult<usize> {
    if core < num_cores {
        Ok(core)
    } else {
        Err(AddressError::CoreOutOfRange { core, num_cores })
    }
}

/// Block-cyclic distribution of element indices over cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BlockCyclic {
    block_size: usize,
    num_cores: usize,
}

impl BlockCyclic {
    pub fn try_new(block_size: usize, num_cores: usize) -> AddressResult<BlockCyclic> {
        if block_size == 0 {
            return Err(AddressError::ZeroBlockSize);
        }
        if num_cores == 0 {
            return Err(AddressError::NoCores);
        }
        Ok(BlockCyclic {
            block_size,
            num_cores,
        })
    }

    pub fn new(block_size: usize, num_cores: usize) -> BlockCyclic {
        match BlockCyclic::try_new(block_size, num_cores) {
            Ok(layout) => layout,
            Err(e) => panic!("invalid block-cyclic layout: {}", e),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    /// The core that owns element `index`
    pub fn core_of(&self, index: usize) -> usize {
        (index / self.block_size) % self.num_cores
    }

    /// The position of element `index` within its owner's local segment
    pub fn local_of(&self, index: usize) -> usize {
        let round = index / (self.block_size * self.num_cores);
        round * self.block_size + index % self.block_size
    }

    /// Inverse of (`core_of`, `local_of`)
    pub fn try_index_of(&self, core: usize, local: usize) -> AddressResult<usize> {
        let core = check_core(core, self.num_cores)?;
        let round = local / self.block_size;
        Ok((round * self.num_cores + core) * self.block_size + local % self.block_size)
    }

    pub fn index_of(&self, core: usize, local: usize) -> usize {
        match self.try_index_of(core, local) {
            Ok(index) => index,
            Err(e) => panic!("{}", e),
        }
    }

    /// Number of the elements in `[0, len)` that `core` stores locally
    pub fn local_len(&self, core: usize, len: usize) -> usize {
        let core = match check_core(core, self.num_cores) {
            Ok(core) => core,
            Err(e) => panic!("{}", e),
        };
        let round_len = self.block_size * self.num_cores;
        let full_rounds = len / round_len;
        let rem = len % round_len;
        let partial = rem
            .saturating_sub(core * self.block_size)
            .min(self.block_size);
        full_rounds * self.block_size + partial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Repr {
    Linear { layout: BlockCyclic, index: usize },
    TwoD { core: usize, num_cores: usize, offset: usize },
}

/// A logical pointer to an element of type `T` somewhere in the job.
pub struct GlobalAddress<T> {
    repr: Repr,
    _elem: PhantomData<fn() -> T>,
}

impl<T> Clone for GlobalAddress<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GlobalAddress<T> {}

impl<T> PartialEq for GlobalAddress<T> {
    fn eq(&self, other: &Self) -> bool {
        self.repr == other.repr
    }
}

impl<T> Eq for GlobalAddress<T> {}

impl<T> std::hash::Hash for GlobalAddress<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.repr.hash(state)
    }
}

impl<T> std::fmt::Debug for GlobalAddress<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.repr {
            Repr::Linear { index, .. } => write!(
                f,
                "GlobalAddress[linear {} => core {} local {}]",
                index,
                self.core(),
                self.local()
            ),
            Repr::TwoD { core, offset, .. } => {
                write!(f, "GlobalAddress[2d core {} offset {}]", core, offset)
            }
        }
    }
}

impl<T> GlobalAddress<T> {
    /// Address of element `index` of a block-cyclic allocation
    pub fn linear(layout: BlockCyclic, index: usize) -> GlobalAddress<T> {
        GlobalAddress {
            repr: Repr::Linear { layout, index },
            _elem: PhantomData,
        }
    }

    pub fn try_two_d(core: usize, num_cores: usize, offset: usize) -> AddressResult<GlobalAddress<T>> {
        let core = check_core(core, num_cores)?;
        Ok(GlobalAddress {
            repr: Repr::TwoD {
                core,
                num_cores,
                offset,
            },
            _elem: PhantomData,
        })
    }

    /// Address of `offset` within `core`'s local memory
    pub fn two_d(core: usize, num_cores: usize, offset: usize) -> GlobalAddress<T> {
        match GlobalAddress::try_two_d(core, num_cores, offset) {
            Ok(addr) => addr,
            Err(e) => panic!("{}", e),
        }
    }

    /// Rebuild a linear address from the pieces returned by [decompose][GlobalAddress::decompose]
    pub fn recompose(layout: BlockCyclic, core: usize, local: usize) -> GlobalAddress<T> {
        GlobalAddress::linear(layout, layout.index_of(core, local))
    }

    /// The (core, local offset) pair this address names
    pub fn decompose(&self) -> (usize, usize) {
        (self.core(), self.local())
    }

    pub fn is_linear(&self) -> bool {
        matches!(self.repr, Repr::Linear { .. })
    }

    /// Global element index for linear addresses
    pub fn index(&self) -> Option<usize> {
        match self.repr {
            Repr::Linear { index, .. } => Some(index),
            Repr::TwoD { .. } => None,
        }
    }

    /// The layout a linear address was created under
    pub fn layout(&self) -> Option<BlockCyclic> {
        match self.repr {
            Repr::Linear { layout, .. } => Some(layout),
            Repr::TwoD { .. } => None,
        }
    }

    pub fn core(&self) -> usize {
        match self.repr {
            Repr::Linear { layout, index } => layout.core_of(index),
            Repr::TwoD { core, .. } => core,
        }
    }

    /// Offset of the element within its owner's local segment
    pub fn local(&self) -> usize {
        match self.repr {
            Repr::Linear { layout, index } => layout.local_of(index),
            Repr::TwoD { offset, .. } => offset,
        }
    }

    /// First element of the block containing this address.
    ///
    /// A two dimensional address is its own single element block.
    pub fn block_min(&self) -> GlobalAddress<T> {
        match self.repr {
            Repr::Linear { layout, index } => {
                GlobalAddress::linear(layout, index - index % layout.block_size)
            }
            Repr::TwoD { .. } => *self,
        }
    }

    /// One past the last element of the block containing this address.
    ///
    /// This is the first element of the next block, which lives on the next core.
    pub fn block_max(&self) -> GlobalAddress<T> {
        match self.repr {
            Repr::Linear { layout, index } => GlobalAddress::linear(
                layout,
                index - index % layout.block_size + layout.block_size,
            ),
            Repr::TwoD { .. } => self.add(1),
        }
    }

    pub fn add(&self, k: usize) -> GlobalAddress<T> {
        let repr = match self.repr {
            Repr::Linear { layout, index } => Repr::Linear {
                layout,
                index: index + k,
            },
            Repr::TwoD {
                core,
                num_cores,
                offset,
            } => Repr::TwoD {
                core,
                num_cores,
                offset: offset + k,
            },
        };
        GlobalAddress {
            repr,
            _elem: PhantomData,
        }
    }

    pub fn sub(&self, k: usize) -> GlobalAddress<T> {
        let repr = match self.repr {
            Repr::Linear { layout, index } => Repr::Linear {
                layout,
                index: index
                    .checked_sub(k)
                    .unwrap_or_else(|| panic!("address arithmetic underflow: {} - {}", index, k)),
            },
            Repr::TwoD {
                core,
                num_cores,
                offset,
            } => Repr::TwoD {
                core,
                num_cores,
                offset: offset
                    .checked_sub(k)
                    .unwrap_or_else(|| panic!("address arithmetic underflow: {} - {}", offset, k)),
            },
        };
        GlobalAddress {
            repr,
            _elem: PhantomData,
        }
    }

    /// Number of elements from `other` to `self`, both must be of the same flavor
    /// (and on the same core if two dimensional).
    pub fn distance(&self, other: &GlobalAddress<T>) -> isize {
        match (self.repr, other.repr) {
            (Repr::Linear { index: a, .. }, Repr::Linear { index: b, .. }) => {
                a as isize - b as isize
            }
            (
                Repr::TwoD {
                    core: ca,
                    offset: a,
                    ..
                },
                Repr::TwoD {
                    core: cb,
                    offset: b,
                    ..
                },
            ) if ca == cb => a as isize - b as isize,
            _ => panic!("distance between unrelated addresses {:?} and {:?}", self, other),
        }
    }

    /// Reinterpret the address as pointing to a different element type
    pub fn cast<U>(&self) -> GlobalAddress<U> {
        GlobalAddress {
            repr: self.repr,
            _elem: PhantomData,
        }
    }
}

impl<T> std::ops::Add<usize> for GlobalAddress<T> {
    type Output = GlobalAddress<T>;
    fn add(self, k: usize) -> GlobalAddress<T> {
        GlobalAddress::add(&self, k)
    }
}

impl<T> std::ops::Sub<usize> for GlobalAddress<T> {
    type Output = GlobalAddress<T>;
    fn sub(self, k: usize) -> GlobalAddress<T> {
        GlobalAddress::sub(&self, k)
    }
}
